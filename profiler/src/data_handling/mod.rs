pub mod category_labels;
pub mod merged_profiles;
pub mod plate_batch;
