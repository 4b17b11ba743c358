pub mod metadata;

pub use metadata::{default_output_dir, load_metadata, metadata_path, save_metadata, AnalysisMetadata};
