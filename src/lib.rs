#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod geom;

use std::fmt;

use geom::{
    ControlCage, CurvatureField, MoldError, MoldGenerator, MoldParameters, MoldSet,
    MoldSetExport, RegionSet, SegmentOptions, SubdivisionEvaluator, Tessellation,
    build_laplacian, compute_curvature,
};
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
#[cfg(target_arch = "wasm32")]
use wasm_bindgen::JsError;
use wasm_bindgen::prelude::*;

cfg_if::cfg_if! {
    if #[cfg(all(feature = "console_error_panic_hook", target_arch = "wasm32"))] {
        #[wasm_bindgen(start)]
        pub fn initialize() {
            console_error_panic_hook::set_once();
            init_logger();
        }
    } else {
        #[wasm_bindgen(start)]
        pub fn initialize() {
            init_logger();
        }
    }
}

#[cfg(feature = "debug_logs")]
fn init_logger() {
    use log::LevelFilter;
    use wasm_bindgen_console_logger::DEFAULT_LOGGER;
    // A second initialize() finds the logger already installed.
    if log::set_logger(&DEFAULT_LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}

#[cfg(not(feature = "debug_logs"))]
fn init_logger() {
    // no-op fallback when debug logs are disabled
}

#[cfg(all(feature = "parallel", target_arch = "wasm32"))]
#[wasm_bindgen]
pub async fn initialize_parallel(worker_count: Option<u32>) -> Result<(), JsError> {
    let threads = worker_count
        .map(|count| count.max(1) as usize)
        .or_else(|| {
            std::thread::available_parallelism()
                .map(|value| value.get())
                .ok()
        })
        .unwrap_or(1);

    wasm_bindgen_rayon::init_thread_pool(threads)
        .await
        .map_err(|err| JsError::new(&format!("could not start rayon thread pool: {err}")))
}

#[macro_export]
macro_rules! debug_log {
    ($($t:tt)*) => {{
        #[cfg(feature = "debug_logs")]
        {
            #[cfg(target_arch = "wasm32")]
            {
                ::web_sys::console::log_1(&::wasm_bindgen::JsValue::from_str(&format!($($t)*)));
            }
            #[cfg(not(target_arch = "wasm32"))]
            {
                println!("{}", format!($($t)*));
            }
        }
    }};
}

/// Analysis results for the currently loaded cage.
struct Analysis {
    evaluator: SubdivisionEvaluator,
    tessellation: Tessellation,
    curvature: CurvatureField,
    regions: RegionSet,
}

/// Browser-facing session: one cage, its tessellation and an editable region set.
#[wasm_bindgen]
pub struct MoldEngine {
    cage: Option<ControlCage>,
    analysis: Option<Analysis>,
    last_set: Option<MoldSet>,
}

#[wasm_bindgen]
impl MoldEngine {
    #[wasm_bindgen(constructor)]
    pub fn new() -> MoldEngine {
        MoldEngine {
            cage: None,
            analysis: None,
            last_set: None,
        }
    }

    /// Loads a cage from flat `xyz` coordinates, per-face vertex counts and indices.
    /// Any previous tessellation and regions are dropped.
    #[wasm_bindgen]
    pub fn load_cage(
        &mut self,
        vertices: Vec<f64>,
        face_sizes: Vec<u32>,
        indices: Vec<u32>,
    ) -> Result<(), JsValue> {
        let cage = ControlCage::from_flat(&vertices, &face_sizes, &indices).map_err(to_js_error)?;
        debug_log!(
            "load_cage: {} vertices, {} faces",
            cage.vertex_count(),
            cage.face_count()
        );
        self.cage = Some(cage);
        self.analysis = None;
        self.last_set = None;
        Ok(())
    }

    /// Tessellates the cage at `level` on a fresh evaluator and prepares curvature data
    /// for segmentation. Returns the tessellation.
    #[wasm_bindgen]
    pub fn tessellate(&mut self, level: u32) -> Result<JsValue, JsValue> {
        let Some(cage) = self.cage.as_ref() else {
            return Err(js_error("no control cage is loaded"));
        };

        let mut evaluator = SubdivisionEvaluator::from_cage(cage);
        let tessellation = evaluator.tessellate(level).map_err(to_js_error)?;
        let laplacian = build_laplacian(&tessellation).map_err(to_js_error)?;
        let curvature = compute_curvature(&tessellation, &laplacian).map_err(to_js_error)?;
        let regions = RegionSet::new(&tessellation, &curvature, SegmentOptions::default())
            .map_err(to_js_error)?;

        let value = to_js(&tessellation)?;
        self.analysis = Some(Analysis {
            evaluator,
            tessellation,
            curvature,
            regions,
        });
        self.last_set = None;
        Ok(value)
    }

    /// Per-vertex curvature of the current tessellation.
    #[wasm_bindgen]
    pub fn curvature(&self) -> Result<JsValue, JsValue> {
        to_js(&self.analysis()?.curvature)
    }

    /// Re-segments with `options` (defaults when `undefined`), keeping pinned regions.
    #[wasm_bindgen]
    pub fn segment(&mut self, options: JsValue) -> Result<JsValue, JsValue> {
        let options: SegmentOptions = from_js_or_default(options)?;
        let analysis = self.analysis_mut()?;
        analysis.regions.set_options(options);
        let regions = analysis.regions.segment().map_err(to_js_error)?;
        to_js(&regions)
    }

    #[wasm_bindgen]
    pub fn regions(&self) -> Result<JsValue, JsValue> {
        to_js(self.analysis()?.regions.regions())
    }

    #[wasm_bindgen]
    pub fn pin_region(&mut self, id: &str, state: bool) -> Result<(), JsValue> {
        self.analysis_mut()?
            .regions
            .pin(id, state)
            .map_err(to_js_error)
    }

    #[wasm_bindgen]
    pub fn edit_region(&mut self, id: &str, faces: Vec<u32>) -> Result<(), JsValue> {
        let faces: Vec<usize> = faces.into_iter().map(|f| f as usize).collect();
        self.analysis_mut()?
            .regions
            .edit(id, &faces)
            .map_err(to_js_error)
    }

    /// Merges regions into the first listed one; returns the surviving id.
    #[wasm_bindgen]
    pub fn merge_regions(&mut self, ids: Vec<String>) -> Result<String, JsValue> {
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        self.analysis_mut()?
            .regions
            .merge(&ids)
            .map_err(to_js_error)
    }

    /// Moves `faces` out of region `id` into a new region; returns the new id.
    #[wasm_bindgen]
    pub fn split_region(&mut self, id: &str, faces: Vec<u32>) -> Result<String, JsValue> {
        let faces: Vec<usize> = faces.into_iter().map(|f| f as usize).collect();
        self.analysis_mut()?
            .regions
            .split(id, &faces)
            .map_err(to_js_error)
    }

    /// Builds one mold per current region with `params` (defaults when `undefined`).
    #[wasm_bindgen]
    pub fn generate(&mut self, params: JsValue) -> Result<JsValue, JsValue> {
        let params: MoldParameters = from_js_or_default(params)?;
        let generator = MoldGenerator::new(params).map_err(to_js_error)?;
        let analysis = self.analysis()?;
        let regions = analysis.regions.regions().to_vec();
        let built = generator
            .build_molds(&analysis.evaluator, &analysis.tessellation, &regions)
            .map_err(to_js_error)?;

        let set = MoldSet {
            tessellation: analysis.tessellation.clone(),
            regions,
            molds: built.molds,
            skipped: built.skipped,
            timing: built.timing,
        };
        let value = to_js(&set)?;
        self.last_set = Some(set);
        Ok(value)
    }

    /// Serializes the last generated mold set; `unix_ms` stamps the export.
    #[wasm_bindgen]
    pub fn export(&self, params: JsValue, unix_ms: f64) -> Result<JsValue, JsValue> {
        let Some(set) = self.last_set.as_ref() else {
            return Err(js_error("no molds have been generated"));
        };
        let params: MoldParameters = from_js_or_default(params)?;
        let generated_at = timestamp_from_unix_ms(unix_ms).map_err(to_js_error)?;
        let export = MoldSetExport::new(set, &params, generated_at).map_err(to_js_error)?;
        to_js(&export)
    }
}

impl Default for MoldEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MoldEngine {
    fn analysis(&self) -> Result<&Analysis, JsValue> {
        self.analysis
            .as_ref()
            .ok_or_else(|| js_error("the cage has not been tessellated"))
    }

    fn analysis_mut(&mut self) -> Result<&mut Analysis, JsValue> {
        self.analysis
            .as_mut()
            .ok_or_else(|| js_error("the cage has not been tessellated"))
    }
}

/// Milliseconds since the epoch, as `Date.now()` reports them.
fn timestamp_from_unix_ms(unix_ms: f64) -> Result<OffsetDateTime, MoldError> {
    if !unix_ms.is_finite() {
        return Err(MoldError::Timestamp(format!(
            "export time {unix_ms} ms is not finite"
        )));
    }
    // Saturating cast; anything that large is rejected by the range check below.
    let nanos = (unix_ms * 1_000_000.0).round() as i128;
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .map_err(|err| MoldError::Timestamp(format!("export time {unix_ms} ms: {err}")))
}

fn to_js<T: serde::Serialize + ?Sized>(value: &T) -> Result<JsValue, JsValue> {
    serde_wasm_bindgen::to_value(value).map_err(to_js_error)
}

fn from_js_or_default<T: DeserializeOwned + Default>(value: JsValue) -> Result<T, JsValue> {
    if value.is_undefined() || value.is_null() {
        return Ok(T::default());
    }
    serde_wasm_bindgen::from_value(value).map_err(to_js_error)
}

fn to_js_error<E: fmt::Display>(error: E) -> JsValue {
    js_error(&error.to_string())
}

fn js_error(message: &str) -> JsValue {
    #[cfg(target_arch = "wasm32")]
    {
        JsError::new(message).into()
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        let _ = message;
        JsValue::NULL
    }
}
