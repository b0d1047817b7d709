use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    ArgumentParse(#[from] clap::Error),
    #[error(transparent)]
    Pipeline(#[from] strata_engine::PipelineError),
    #[error(transparent)]
    Report(#[from] strata_report::ReportError),
}
