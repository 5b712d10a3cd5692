//! HandBrake Queue Daemon
//!
//! Background service that keeps a persistent queue of transcoding jobs and
//! runs them one at a time through the HandBrake command-line encoder.

pub mod daemon;
pub mod jobs;
pub mod progress;
pub mod queue;
pub mod scan;
pub mod server;
pub mod startup;
pub mod store;
pub mod supervisor;

pub use daemon::{Daemon, DaemonError, DaemonHandle, DispatchState, OpResult, QueueSnapshot};
pub use handbrake_queue_config as config;
pub use handbrake_queue_config::Config;
pub use jobs::{status, validate_source_path, Job, JobError, JobFactory};
pub use progress::{parse_percent, ParserState, ProgressTracker, ProgressUpdate};
pub use queue::{clamp_move_target, QueueError, QueueState, Removal};
pub use scan::{find_all_media_files, is_media_file, MEDIA_EXTENSIONS};
pub use server::{create_router, run_server, ServerError};
pub use startup::{check_encoder_available, check_root_folder, run_startup_checks, StartupError};
pub use store::{PersistError, StateStore};
pub use supervisor::{ExitOutcome, ProcessEvent, ProcessHandle, SupervisorError};
