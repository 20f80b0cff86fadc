#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
fn main() {
    if let Err(err) = native::run() {
        eprintln!("mold_cli error: {err}");
        std::process::exit(1);
    }
}

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use mold_engine::geom::{
        ControlCage, KeyGeometry, MoldGenerator, MoldParameters, MoldSet, Solid, Tessellation,
    };
    use std::fs::{self, File};
    use std::io::{BufWriter, Write};
    use std::path::{Path, PathBuf};

    const USAGE: &str = r#"mold_cli (mold-engine)

USAGE:
  mold_cli list
  mold_cli run <scenario> [options]

SCENARIOS:
  cube         unit cube cage
  flat_patch   single planar 4x4 grid
  saddle       hyperbolic height field

OPTIONS (run):
  --obj <path>       Write the tessellation as OBJ
  --level <n>        Tessellation level (default 3)
  --overwrite        Overwrite an existing OBJ file
  -h, --help         Show this help
"#;

    pub fn run() -> Result<(), String> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        let mut args = Args::new(args);

        let Some(command) = args.next() else {
            println!("{USAGE}");
            return Ok(());
        };

        match command.as_str() {
            "list" => {
                for scenario in Scenario::ALL {
                    println!("{}", scenario.name());
                }
                Ok(())
            }
            "run" => cmd_run(&mut args),
            "-h" | "--help" | "help" => {
                println!("{USAGE}");
                Ok(())
            }
            other => Err(format!("unknown command `{other}`\n\n{USAGE}")),
        }
    }

    fn cmd_run(args: &mut Args) -> Result<(), String> {
        let name = args.next().ok_or("missing scenario name")?;
        let scenario = Scenario::from_name(&name).ok_or_else(|| {
            let names: Vec<&str> = Scenario::ALL.iter().map(|s| s.name()).collect();
            format!("unknown scenario `{name}` (expected one of: {})", names.join(", "))
        })?;

        let mut obj_path: Option<PathBuf> = None;
        let mut level = 3;
        let mut overwrite = false;
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--obj" => obj_path = Some(PathBuf::from(args.value("--obj")?)),
                "--level" => {
                    let value = args.value("--level")?;
                    level = value
                        .parse()
                        .map_err(|e| format!("invalid --level `{value}`: {e}"))?;
                }
                "--overwrite" => overwrite = true,
                "-h" | "--help" => {
                    println!("{USAGE}");
                    return Ok(());
                }
                other => return Err(format!("unknown option `{other}`\n\n{USAGE}")),
            }
        }

        let (cage, params) = scenario.setup();
        let params = params.with_tessellation_level(level);
        let generator = MoldGenerator::new(params).map_err(|e| e.to_string())?;
        let set = generator.generate(&cage).map_err(|e| e.to_string())?;

        print_summary(scenario, &set);
        if let Some(path) = obj_path {
            write_obj_file(&path, &set.tessellation, scenario.name(), overwrite)?;
            println!("wrote {}", path.display());
        }
        Ok(())
    }

    fn print_summary(scenario: Scenario, set: &MoldSet) {
        println!(
            "{}: {} vertices, {} triangles, {} regions",
            scenario.name(),
            set.tessellation.vertex_count(),
            set.tessellation.triangle_count(),
            set.regions.len()
        );
        for region in &set.regions {
            println!(
                "  {:<10} faces={:<5} unity={:.3} pinned={} ({})",
                region.id,
                region.len(),
                region.unity_strength,
                region.pinned,
                region.unity_principle
            );
        }
        for mold in &set.molds {
            let diagnostics = mold.solid.diagnostics();
            println!(
                "  mold {:<10} max={:.3e} rms={:.3e} accepted={} triangles={} keys={} [{}]",
                mold.region_id,
                mold.quality.max_deviation,
                mold.quality.rms_deviation,
                mold.accepted,
                mold.solid.solid.triangle_count(),
                mold.solid.keys.len(),
                diagnostics.summary()
            );
        }
        for skipped in &set.skipped {
            println!("  skipped {}: {}", skipped.region_id, skipped.reason);
        }
        if let Some(timing) = set.timing.as_ref() {
            for (label, ns) in timing.entries() {
                println!("  time {label:<12} {:.3} ms", ns as f64 / 1_000_000.0);
            }
        }
    }

    fn write_obj_file(
        path: &Path,
        mesh: &Tessellation,
        name: &str,
        overwrite: bool,
    ) -> Result<(), String> {
        mesh.validate()
            .map_err(|e| format!("tessellation validation failed: {e}"))?;

        if path.exists() && !overwrite {
            return Err(format!(
                "refusing to overwrite existing file {} (use --overwrite)",
                path.display()
            ));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("create dir {}: {e}", parent.display()))?;
        }

        let file = File::create(path).map_err(|e| format!("create {}: {e}", path.display()))?;
        let mut w = BufWriter::new(file);
        let err = |e: std::io::Error| format!("write obj: {e}");

        writeln!(w, "# mold-engine mold_cli").map_err(err)?;
        writeln!(w, "o {name}").map_err(err)?;
        for p in &mesh.positions {
            writeln!(w, "v {} {} {}", p.x, p.y, p.z).map_err(err)?;
        }
        for n in &mesh.normals {
            writeln!(w, "vn {} {} {}", n.x, n.y, n.z).map_err(err)?;
        }
        for tri in &mesh.triangles {
            let [a, b, c] = tri.map(|i| i + 1);
            writeln!(w, "f {a}//{a} {b}//{b} {c}//{c}").map_err(err)?;
        }
        w.flush().map_err(err)
    }

    #[derive(Debug, Clone, Copy)]
    enum Scenario {
        Cube,
        FlatPatch,
        Saddle,
    }

    impl Scenario {
        const ALL: &'static [Scenario] = &[Scenario::Cube, Scenario::FlatPatch, Scenario::Saddle];

        fn name(self) -> &'static str {
            match self {
                Scenario::Cube => "cube",
                Scenario::FlatPatch => "flat_patch",
                Scenario::Saddle => "saddle",
            }
        }

        fn from_name(name: &str) -> Option<Self> {
            Self::ALL.iter().copied().find(|s| s.name() == name)
        }

        /// Cage plus parameters scaled to the cage's size.
        fn setup(self) -> (ControlCage, MoldParameters) {
            let small_keys = KeyGeometry::default().with_radius(0.02).with_height(0.05);
            match self {
                Scenario::Cube => (
                    ControlCage::unit_cube(),
                    MoldParameters::default()
                        .with_wall_thickness(0.05)
                        .with_registration_keys(4, small_keys)
                        .with_deviation_tolerance(0.02),
                ),
                Scenario::FlatPatch => (
                    ControlCage::planar_grid(4, 4, 1.0, 1.0),
                    MoldParameters::default()
                        .with_wall_thickness(0.1)
                        .with_registration_keys(4, small_keys)
                        .with_deviation_tolerance(1e-6),
                ),
                Scenario::Saddle => (
                    ControlCage::height_field(6, 6, 1.0, |x, y| 0.3 * (x * x - y * y)),
                    MoldParameters::default()
                        .with_wall_thickness(0.05)
                        .with_registration_keys(4, small_keys)
                        .with_deviation_tolerance(0.02),
                ),
            }
        }
    }

    struct Args {
        args: Vec<String>,
        pos: usize,
    }

    impl Args {
        fn new(args: Vec<String>) -> Self {
            Self { args, pos: 0 }
        }

        fn next(&mut self) -> Option<String> {
            let arg = self.args.get(self.pos)?.clone();
            self.pos += 1;
            Some(arg)
        }

        fn value(&mut self, flag: &str) -> Result<String, String> {
            self.next().ok_or_else(|| format!("missing value for {flag}"))
        }
    }
}
