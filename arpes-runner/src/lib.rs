//! ARPES Runner — pipeline orchestration, caching, configuration and export.
//!
//! This crate builds on `arpes-core` to provide:
//! - TOML pipeline configuration (metadata, ordered corrections, fit)
//! - Pipeline orchestrator threading arrays and provenance nodes
//! - Fingerprint-keyed result cache with at-most-once computation
//! - JSON / CSV artifact export

pub mod cache;
pub mod config;
pub mod export;
pub mod pipeline;

pub use cache::FingerprintCache;
pub use config::{ConfigError, FitConfig, PipelineConfig, ResolvedFit};
pub use export::{
    export_array_json, export_fit_csv, export_provenance_json, import_array_json,
    import_provenance_json, save_artifacts,
};
pub use pipeline::{
    Pipeline, PipelineError, PipelineOutput, PipelineReport, StepCache, StepError, StepProduct,
    StepReport,
};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn step_cache_is_send_sync() {
        assert_send::<StepCache>();
        assert_sync::<StepCache>();
    }

    #[test]
    fn config_types_are_send_sync() {
        assert_send::<PipelineConfig>();
        assert_sync::<PipelineConfig>();
        assert_send::<FitConfig>();
        assert_sync::<FitConfig>();
    }

    #[test]
    fn pipeline_output_is_send_sync() {
        assert_send::<PipelineOutput>();
        assert_sync::<PipelineOutput>();
        assert_send::<PipelineError>();
        assert_sync::<PipelineError>();
    }
}
