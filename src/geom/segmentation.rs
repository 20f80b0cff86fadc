//! Curvature-driven region segmentation with user pin/edit overrides.
//!
//! Regions grow from high-|K| seeds across edge-adjacent triangles while the Gaussian
//! curvature variance of the region stays under a threshold. Pinned regions are never
//! regrown: their triangles are removed from the pool before growth starts and they are
//! carried into the new result unchanged.
//!
//! [`RegionSet`] is the editable arena: it keeps the per-triangle curvature snapshot the
//! last segmentation used so that `edit`, `merge` and `split` can rescore regions without
//! touching the rest.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use super::cancel::{CancellationToken, Cancelled};
use super::curvature::{CurvatureClass, CurvatureField, CurvatureThresholds};
use super::mesh::Tessellation;

/// Candidates whose variances differ by less than this are considered tied.
const VARIANCE_TIE: f64 = 1e-12;

// ============================================================================
// Errors and options
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SegmentationError {
    #[error("unknown region '{id}'")]
    UnknownRegion { id: String },

    #[error("region '{id}' would have no faces")]
    EmptyRegion { id: String },

    #[error("triangle index {index} is out of range for {triangle_count} triangles")]
    InvalidFaceIndex { index: usize, triangle_count: usize },

    #[error("triangle {face} of region '{id}' already belongs to region '{other}'")]
    OverlappingRegions { id: String, other: String, face: usize },

    #[error("merge needs at least two regions, got {count}")]
    InsufficientRegions { count: usize },

    #[error("region '{id}' is pinned and cannot be merged")]
    PinnedRegion { id: String },

    #[error("region '{id}' is invalid: {reason}")]
    InvalidRegion { id: String, reason: String },

    #[error("curvature field has {curvature} vertices but the tessellation has {vertices}")]
    SizeMismatch { curvature: usize, vertices: usize },

    #[error("non-finite value produced during {stage}")]
    NonFinite { stage: &'static str },

    #[error("segmentation cancelled")]
    Cancelled,
}

impl From<Cancelled> for SegmentationError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentOptions {
    /// `|K|` below which a triangle counts as developable.
    pub developability_epsilon: f64,
    /// Largest Gaussian-curvature variance a region may reach while growing.
    pub variance_threshold: f64,
    /// Regions with fewer triangles are merged into a neighbour.
    pub min_region_size: usize,
    /// Upper bound on the region count, pinned regions included; `0` disables it. Grown
    /// regions are merged smallest first until the bound holds.
    pub max_regions: usize,
    pub curvature_thresholds: CurvatureThresholds,
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self {
            developability_epsilon: 0.01,
            variance_threshold: 0.05,
            min_region_size: 16,
            max_regions: 8,
            curvature_thresholds: CurvatureThresholds::default(),
        }
    }
}

impl SegmentOptions {
    #[must_use]
    pub fn with_developability_epsilon(mut self, epsilon: f64) -> Self {
        self.developability_epsilon = epsilon;
        self
    }

    #[must_use]
    pub fn with_variance_threshold(mut self, threshold: f64) -> Self {
        self.variance_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_min_region_size(mut self, size: usize) -> Self {
        self.min_region_size = size;
        self
    }

    #[must_use]
    pub fn with_max_regions(mut self, count: usize) -> Self {
        self.max_regions = count;
        self
    }

    #[must_use]
    pub fn with_curvature_thresholds(mut self, thresholds: CurvatureThresholds) -> Self {
        self.curvature_thresholds = thresholds;
        self
    }
}

// ============================================================================
// Region
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    /// Sorted, unique triangle indices.
    pub faces: Vec<usize>,
    pub pinned: bool,
    /// Area fraction of developable triangles, in `[0, 1]`.
    pub unity_strength: f64,
    pub unity_principle: String,
    pub curvature_class: CurvatureClass,
    /// Set once the user edited, merged or split the region.
    pub modified: bool,
}

impl Region {
    #[must_use]
    pub fn len(&self) -> usize {
        self.faces.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    #[must_use]
    pub fn contains(&self, triangle: usize) -> bool {
        self.faces.binary_search(&triangle).is_ok()
    }
}

/// Structural checks on a region: non-empty id and face set, sorted unique faces,
/// finite strength in `[0, 1]`.
///
/// # Errors
/// `EmptyRegion` or `InvalidRegion` describing the first violated rule.
pub fn validate_region(region: &Region) -> Result<(), SegmentationError> {
    let invalid = |reason: &str| SegmentationError::InvalidRegion {
        id: region.id.clone(),
        reason: reason.to_string(),
    };
    if region.id.trim().is_empty() {
        return Err(invalid("empty id"));
    }
    if region.faces.is_empty() {
        return Err(SegmentationError::EmptyRegion {
            id: region.id.clone(),
        });
    }
    if region.faces.windows(2).any(|w| w[0] >= w[1]) {
        return Err(invalid("faces are not sorted and unique"));
    }
    if !(0.0..=1.0).contains(&region.unity_strength) {
        return Err(invalid("unity strength outside [0, 1]"));
    }
    Ok(())
}

// ============================================================================
// Per-triangle snapshot
// ============================================================================

#[derive(Debug, Clone, Default)]
struct TriangleField {
    gaussian: Vec<f64>,
    mean: Vec<f64>,
    area: Vec<f64>,
    neighbors: Vec<[Option<usize>; 3]>,
}

impl TriangleField {
    fn new(
        tessellation: &Tessellation,
        curvature: &CurvatureField,
    ) -> Result<Self, SegmentationError> {
        if curvature.len() != tessellation.vertex_count() {
            return Err(SegmentationError::SizeMismatch {
                curvature: curvature.len(),
                vertices: tessellation.vertex_count(),
            });
        }
        let gaussian = curvature.triangle_gaussian(tessellation);
        if gaussian.iter().any(|k| !k.is_finite()) {
            return Err(SegmentationError::NonFinite {
                stage: "triangle curvature",
            });
        }
        Ok(Self {
            gaussian,
            mean: curvature.triangle_mean(tessellation),
            area: (0..tessellation.triangle_count())
                .map(|t| tessellation.triangle_area(t))
                .collect(),
            neighbors: tessellation.triangle_neighbors(),
        })
    }

    fn len(&self) -> usize {
        self.gaussian.len()
    }

    fn normalize_faces(&self, faces: &[usize]) -> Result<Vec<usize>, SegmentationError> {
        let set: BTreeSet<usize> = faces.iter().copied().collect();
        if let Some(&index) = set.iter().find(|&&t| t >= self.len()) {
            return Err(SegmentationError::InvalidFaceIndex {
                index,
                triangle_count: self.len(),
            });
        }
        Ok(set.into_iter().collect())
    }

    fn make_region(
        &self,
        id: String,
        faces: Vec<usize>,
        options: &SegmentOptions,
    ) -> Result<Region, SegmentationError> {
        // Folding from +0.0: an empty float sum is -0.0.
        let total = faces.iter().fold(0.0, |acc, &t| acc + self.area[t]);
        let developable = faces
            .iter()
            .filter(|&&t| self.gaussian[t].abs() < options.developability_epsilon)
            .fold(0.0, |acc, &t| acc + self.area[t]);
        let unity_strength = if total > 0.0 {
            (developable / total).clamp(0.0, 1.0)
        } else {
            0.0
        };
        if !unity_strength.is_finite() {
            return Err(SegmentationError::NonFinite {
                stage: "unity strength",
            });
        }

        let mut class_area: BTreeMap<CurvatureClass, f64> = BTreeMap::new();
        for &t in &faces {
            let class = CurvatureClass::classify(
                self.gaussian[t],
                self.mean[t],
                options.curvature_thresholds,
            );
            *class_area.entry(class).or_insert(0.0) += self.area[t];
        }
        let curvature_class = class_area
            .iter()
            .fold(None, |best: Option<(CurvatureClass, f64)>, (&class, &area)| {
                match best {
                    Some((_, best_area)) if best_area >= area => best,
                    _ => Some((class, area)),
                }
            })
            .map_or(CurvatureClass::Planar, |(class, _)| class);

        Ok(Region {
            unity_principle: format!(
                "Similar {} across {} faces",
                curvature_class.description(),
                faces.len()
            ),
            id,
            faces,
            pinned: false,
            unity_strength,
            curvature_class,
            modified: false,
        })
    }

    /// Grows one region from `seed` over unowned triangles.
    fn grow(&self, seed: usize, owned: &[bool], threshold: f64) -> Vec<usize> {
        let mut members = vec![seed];
        let mut inside = BTreeSet::from([seed]);
        let mut sum = self.gaussian[seed];
        let mut sum_sq = sum * sum;
        let mut frontier: BTreeSet<usize> = BTreeSet::new();
        let mut queue = VecDeque::from([seed]);

        loop {
            while let Some(t) = queue.pop_front() {
                for n in self.neighbors[t].iter().flatten() {
                    if !owned[*n] && !inside.contains(n) {
                        frontier.insert(*n);
                    }
                }
            }

            let count = members.len() as f64 + 1.0;
            let mut best: Option<(usize, f64)> = None;
            for &candidate in &frontier {
                let k = self.gaussian[candidate];
                let mean = (sum + k) / count;
                let variance = ((sum_sq + k * k) / count - mean * mean).max(0.0);
                if variance > threshold {
                    continue;
                }
                best = match best {
                    None => Some((candidate, variance)),
                    Some((current, best_variance)) => {
                        if variance < best_variance - VARIANCE_TIE
                            || ((variance - best_variance).abs() <= VARIANCE_TIE
                                && self.area[candidate] > self.area[current])
                        {
                            Some((candidate, variance))
                        } else {
                            Some((current, best_variance))
                        }
                    }
                };
            }

            let Some((chosen, _)) = best else {
                break;
            };
            frontier.remove(&chosen);
            inside.insert(chosen);
            members.push(chosen);
            let k = self.gaussian[chosen];
            sum += k;
            sum_sq += k * k;
            queue.push_back(chosen);
        }

        members.sort_unstable();
        members
    }
}

// ============================================================================
// Segmentation
// ============================================================================

/// Segments the tessellation, carrying `pinned` regions through verbatim.
///
/// # Errors
/// See [`segment_with_cancel`].
pub fn segment(
    tessellation: &Tessellation,
    curvature: &CurvatureField,
    pinned: &[Region],
    options: &SegmentOptions,
) -> Result<Vec<Region>, SegmentationError> {
    segment_with_cancel(tessellation, curvature, pinned, options, &CancellationToken::new())
}

/// # Errors
/// `SizeMismatch`, `InvalidFaceIndex` or `OverlappingRegions` for inconsistent inputs,
/// `NonFinite` for NaN curvature, `Cancelled` when the token fires between seeds.
pub fn segment_with_cancel(
    tessellation: &Tessellation,
    curvature: &CurvatureField,
    pinned: &[Region],
    options: &SegmentOptions,
    token: &CancellationToken,
) -> Result<Vec<Region>, SegmentationError> {
    let field = TriangleField::new(tessellation, curvature)?;
    run_segmentation(&field, pinned, options, token)
}

/// Scores triangle groups chosen elsewhere as regions, keeping their order and ids.
pub(crate) fn regions_from_groups(
    tessellation: &Tessellation,
    curvature: &CurvatureField,
    groups: Vec<(String, Vec<usize>)>,
    options: &SegmentOptions,
) -> Result<Vec<Region>, SegmentationError> {
    let field = TriangleField::new(tessellation, curvature)?;
    groups
        .into_iter()
        .map(|(id, faces)| {
            let faces = field.normalize_faces(&faces)?;
            field.make_region(id, faces, options)
        })
        .collect()
}

fn run_segmentation(
    field: &TriangleField,
    pinned: &[Region],
    options: &SegmentOptions,
    token: &CancellationToken,
) -> Result<Vec<Region>, SegmentationError> {
    log::debug!(
        "segmentation: {} triangles, {} pinned regions",
        field.len(),
        pinned.len()
    );

    let mut owner: Vec<Option<usize>> = vec![None; field.len()];
    let mut regions: Vec<Region> = Vec::new();
    for region in pinned {
        let index = regions.len();
        for &t in &region.faces {
            let slot = owner
                .get_mut(t)
                .ok_or(SegmentationError::InvalidFaceIndex {
                    index: t,
                    triangle_count: field.len(),
                })?;
            if let Some(other) = *slot {
                return Err(SegmentationError::OverlappingRegions {
                    id: region.id.clone(),
                    other: regions[other].id.clone(),
                    face: t,
                });
            }
            *slot = Some(index);
        }
        let mut kept = region.clone();
        kept.pinned = true;
        regions.push(kept);
    }
    let pinned_count = regions.len();

    let mut seeds: Vec<usize> = (0..field.len()).filter(|&t| owner[t].is_none()).collect();
    seeds.sort_by(|&a, &b| {
        field.gaussian[b]
            .abs()
            .total_cmp(&field.gaussian[a].abs())
            .then(a.cmp(&b))
    });

    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut owned: Vec<bool> = owner.iter().map(Option::is_some).collect();
    for seed in seeds {
        if owned[seed] {
            continue;
        }
        token.check()?;
        let members = field.grow(seed, &owned, options.variance_threshold);
        for &t in &members {
            owned[t] = true;
        }
        groups.push(members);
    }

    let max_grown = (options.max_regions > 0)
        .then(|| options.max_regions.saturating_sub(pinned_count).max(1));
    let groups = merge_groups(field, groups, &owner, options.min_region_size, max_grown);
    token.check()?;

    let mut used: BTreeSet<String> = regions.iter().map(|r| r.id.clone()).collect();
    let mut counter = 0;
    for faces in groups {
        let id = fresh_id(&mut used, &mut counter);
        regions.push(field.make_region(id, faces, options)?);
    }

    log::debug!(
        "segmentation: {} regions ({} grown)",
        regions.len(),
        regions.len() - pinned_count
    );
    Ok(regions)
}

fn fresh_id(used: &mut BTreeSet<String>, counter: &mut usize) -> String {
    loop {
        let id = format!("region_{counter}");
        *counter += 1;
        if used.insert(id.clone()) {
            return id;
        }
    }
}

/// Folds grown groups into the neighbour they share the most edges with: first those
/// smaller than `min_size`, then, while more than `max_groups` remain, the smallest.
/// Pinned triangles (`pinned_owner`) never absorb anything.
fn merge_groups(
    field: &TriangleField,
    mut groups: Vec<Vec<usize>>,
    pinned_owner: &[Option<usize>],
    min_size: usize,
    max_groups: Option<usize>,
) -> Vec<Vec<usize>> {
    let mut group_of: Vec<Option<usize>> = vec![None; field.len()];
    for (g, faces) in groups.iter().enumerate() {
        for &t in faces {
            group_of[t] = Some(g);
        }
    }

    let most_shared = |groups: &[Vec<usize>], group_of: &[Option<usize>], g: usize| {
        let mut shared: BTreeMap<usize, usize> = BTreeMap::new();
        for &t in &groups[g] {
            for &n in field.neighbors[t].iter().flatten() {
                if pinned_owner[n].is_some() {
                    continue;
                }
                if let Some(other) = group_of[n].filter(|&o| o != g) {
                    *shared.entry(other).or_insert(0) += 1;
                }
            }
        }
        shared
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(target, _)| target)
    };

    let mut merged = 0;
    loop {
        let live = groups.iter().filter(|g| !g.is_empty()).count();
        let over_cap = max_groups.is_some_and(|max| live > max);
        let mut candidates: Vec<usize> = (0..groups.len())
            .filter(|&g| !groups[g].is_empty() && (over_cap || groups[g].len() < min_size))
            .collect();
        candidates.sort_by_key(|&g| (groups[g].len(), g));

        let Some((from, into)) = candidates
            .into_iter()
            .find_map(|g| most_shared(&groups, &group_of, g).map(|target| (g, target)))
        else {
            break;
        };
        let moved = std::mem::take(&mut groups[from]);
        for &t in &moved {
            group_of[t] = Some(into);
        }
        groups[into].extend(moved);
        groups[into].sort_unstable();
        merged += 1;
    }

    if merged > 0 {
        log::debug!("segmentation: merged {merged} regions into neighbours");
    }
    groups.retain(|g| !g.is_empty());
    groups
}

// ============================================================================
// RegionSet arena
// ============================================================================

/// Editable collection of regions over one tessellation.
#[derive(Debug, Clone)]
pub struct RegionSet {
    regions: Vec<Region>,
    field: TriangleField,
    options: SegmentOptions,
}

impl RegionSet {
    /// Empty arena bound to a tessellation's curvature snapshot.
    ///
    /// # Errors
    /// `SizeMismatch` or `NonFinite` for inconsistent curvature data.
    pub fn new(
        tessellation: &Tessellation,
        curvature: &CurvatureField,
        options: SegmentOptions,
    ) -> Result<Self, SegmentationError> {
        Ok(Self {
            regions: Vec::new(),
            field: TriangleField::new(tessellation, curvature)?,
            options,
        })
    }

    #[must_use]
    pub fn options(&self) -> &SegmentOptions {
        &self.options
    }

    /// Options for the next [`segment`](Self::segment); current regions are kept.
    pub fn set_options(&mut self, options: SegmentOptions) {
        self.options = options;
    }

    #[must_use]
    pub fn triangle_count(&self) -> usize {
        self.field.len()
    }

    /// Discards unpinned regions and regrows the remainder.
    ///
    /// # Errors
    /// See [`segment_with_cancel`].
    pub fn segment(&mut self) -> Result<&[Region], SegmentationError> {
        self.segment_with_cancel(&CancellationToken::new())
    }

    /// # Errors
    /// See [`segment_with_cancel`](fn@segment_with_cancel).
    pub fn segment_with_cancel(
        &mut self,
        token: &CancellationToken,
    ) -> Result<&[Region], SegmentationError> {
        let pinned: Vec<Region> = self.regions.iter().filter(|r| r.pinned).cloned().collect();
        self.regions = run_segmentation(&self.field, &pinned, &self.options, token)?;
        Ok(&self.regions)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Region> {
        self.regions.iter().find(|r| r.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    fn position(&self, id: &str) -> Result<usize, SegmentationError> {
        self.regions
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| SegmentationError::UnknownRegion { id: id.to_string() })
    }

    /// Sets the pinned flag without touching membership.
    ///
    /// # Errors
    /// `UnknownRegion`.
    pub fn pin(&mut self, id: &str, state: bool) -> Result<(), SegmentationError> {
        let index = self.position(id)?;
        self.regions[index].pinned = state;
        log::debug!("segmentation: region '{id}' pinned = {state}");
        Ok(())
    }

    /// Replaces the face set of one region and rescores only that region.
    ///
    /// # Errors
    /// `UnknownRegion`, `EmptyRegion`, `InvalidFaceIndex`, or `OverlappingRegions` when a
    /// face already belongs to another region.
    pub fn edit(&mut self, id: &str, faces: &[usize]) -> Result<(), SegmentationError> {
        let index = self.position(id)?;
        let faces = self.field.normalize_faces(faces)?;
        if faces.is_empty() {
            return Err(SegmentationError::EmptyRegion { id: id.to_string() });
        }
        self.check_disjoint(id, &faces, &[index])?;

        let previous = &self.regions[index];
        let mut region = self.field.make_region(id.to_string(), faces, &self.options)?;
        region.pinned = previous.pinned;
        region.modified = true;
        self.regions[index] = region;
        Ok(())
    }

    /// Combines two or more unpinned regions into the first one listed. Returns its id.
    ///
    /// # Errors
    /// `InsufficientRegions`, `UnknownRegion`, or `PinnedRegion`.
    pub fn merge(&mut self, ids: &[&str]) -> Result<String, SegmentationError> {
        let unique: BTreeSet<&str> = ids.iter().copied().collect();
        if ids.len() < 2 || unique.len() != ids.len() {
            return Err(SegmentationError::InsufficientRegions { count: unique.len() });
        }
        let mut indices = Vec::with_capacity(ids.len());
        for &id in ids {
            let index = self.position(id)?;
            if self.regions[index].pinned {
                return Err(SegmentationError::PinnedRegion { id: id.to_string() });
            }
            indices.push(index);
        }

        let mut faces: Vec<usize> = indices
            .iter()
            .flat_map(|&i| self.regions[i].faces.iter().copied())
            .collect();
        faces.sort_unstable();
        faces.dedup();

        let keep_id = ids[0].to_string();
        let mut region = self.field.make_region(keep_id.clone(), faces, &self.options)?;
        region.modified = true;

        let target = indices[0];
        self.regions[target] = region;
        let drop: BTreeSet<usize> = indices[1..].iter().copied().collect();
        let mut i = 0;
        self.regions.retain(|_| {
            let keep = !drop.contains(&i);
            i += 1;
            keep
        });
        log::debug!("segmentation: merged {} regions into '{keep_id}'", ids.len());
        Ok(keep_id)
    }

    /// Moves `faces` out of region `id` into a new region. Returns the new region's id.
    ///
    /// # Errors
    /// `UnknownRegion`, `InvalidFaceIndex` for faces outside the region, `EmptyRegion` if
    /// either part would be empty.
    pub fn split(&mut self, id: &str, faces: &[usize]) -> Result<String, SegmentationError> {
        let index = self.position(id)?;
        let part = self.field.normalize_faces(faces)?;
        let source = &self.regions[index];
        if let Some(&outside) = part.iter().find(|&&t| !source.contains(t)) {
            return Err(SegmentationError::InvalidFaceIndex {
                index: outside,
                triangle_count: self.field.len(),
            });
        }
        let rest: Vec<usize> = source
            .faces
            .iter()
            .copied()
            .filter(|t| part.binary_search(t).is_err())
            .collect();
        if part.is_empty() || rest.is_empty() {
            return Err(SegmentationError::EmptyRegion { id: id.to_string() });
        }

        let pinned = source.pinned;
        let mut used: BTreeSet<String> = self.regions.iter().map(|r| r.id.clone()).collect();
        let mut counter = 0;
        let new_id = fresh_id(&mut used, &mut counter);

        let mut kept = self.field.make_region(id.to_string(), rest, &self.options)?;
        kept.pinned = pinned;
        kept.modified = true;
        let mut split_off = self.field.make_region(new_id.clone(), part, &self.options)?;
        split_off.modified = true;

        self.regions[index] = kept;
        self.regions.insert(index + 1, split_off);
        Ok(new_id)
    }

    /// Triangles owned by no region, ascending.
    #[must_use]
    pub fn unassigned_triangles(&self) -> Vec<usize> {
        let mut owned = vec![false; self.field.len()];
        for region in &self.regions {
            for &t in &region.faces {
                owned[t] = true;
            }
        }
        (0..owned.len()).filter(|&t| !owned[t]).collect()
    }

    fn check_disjoint(
        &self,
        id: &str,
        faces: &[usize],
        skip: &[usize],
    ) -> Result<(), SegmentationError> {
        for (i, other) in self.regions.iter().enumerate() {
            if skip.contains(&i) {
                continue;
            }
            if let Some(&face) = faces.iter().find(|&&t| other.contains(t)) {
                return Err(SegmentationError::OverlappingRegions {
                    id: id.to_string(),
                    other: other.id.clone(),
                    face,
                });
            }
        }
        Ok(())
    }
}
