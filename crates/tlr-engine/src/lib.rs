pub mod case_runner;
pub mod crash_collector;
pub mod executor;
pub mod get_processor;
pub mod reboot;
pub mod result_writer;
pub mod run_driver;
pub mod set_runner;
pub mod step_post_processor;
pub mod step_runner;

pub use case_runner::{run_case, CaseManualHelper, CaseRunnerError, NoopCaseManualHelper, PowerStreamer, RunCounters};
pub use crash_collector::CollectorError;
pub use executor::{ExecConfig, ExecOutcome, Executor, ExecutorError};
pub use get_processor::GetError;
pub use reboot::{PollingRebootWaiter, RebootWaiter};
pub use result_writer::{JsonResultWriter, ResultWriter, TestResultDocument, WriterError};
pub use run_driver::{run, CurrentAnchors};
pub use set_runner::{run_set, SetRunnerError};
pub use step_runner::StepRunnerError;
