mod test_constraints_basic;
mod test_curvature_basic;
mod test_laplacian_basic;
mod test_segmentation_basic;
mod test_subdivision_basic;
mod test_surface_fit_basic;
