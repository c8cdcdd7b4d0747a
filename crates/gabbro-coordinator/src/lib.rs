//! # gabbro-coordinator: Query lifecycle coordination for `Gabbro`
//!
//! This crate owns a query's in-memory state from submission through its
//! terminal outcome. It does not plan, schedule, or move data; those
//! collaborators feed it stage telemetry, failure signals, and output
//! locations, and it keeps the lifecycle correct under concurrency.
//!
//! ## Key Principles
//!
//! - **Terminal absorption**: FINISHED and FAILED absorb all further
//!   transitions, no matter who races whom.
//! - **Exactly-once side effects**: cleanup, transaction finalization, and
//!   the final snapshot each fire at most once across any schedule.
//! - **Asynchronous listeners**: callbacks run on a notification executor,
//!   never on the mutator's thread, and may arrive out of order.
//! - **First-write-wins records**: the failure cause and the started
//!   transaction id keep their first value.
//!
//! ## Architecture
//!
//! - [`state_register`]: generic terminal-absorbing state cell
//! - [`phase_timer`]: wall-clock and monotonic lifecycle timings
//! - [`output_publisher`]: output schema and exchange-location fan-out
//! - [`controller`]: the [`QueryController`] tying it all together
//! - [`snapshot`]: immutable query/stage info value objects
//! - [`traits`]: collaborator contracts plus in-memory implementations
//! - [`executor`]: the notification executor listeners run on
//!
//! ## Example
//!
//! ```ignore
//! use gabbro_coordinator::{CoordinatorServices, QueryController, ThreadPoolExecutor};
//!
//! let executor = Arc::new(ThreadPoolExecutor::new(ExecutorConfig::default()));
//! let controller = QueryController::begin(
//!     session,
//!     "SELECT 1",
//!     None,
//!     "http://coordinator/v1/query/q1",
//!     ResourceGroupId::global("adhoc"),
//!     CoordinatorServices::default(),
//!     executor,
//! );
//!
//! controller.to_dispatching();
//! // ... planning, execution ...
//! controller.to_finishing();
//! ```

pub mod controller;
pub mod error;
pub mod executor;
pub mod memory;
pub mod output_publisher;
pub mod phase_timer;
pub mod session;
pub mod snapshot;
pub mod state_register;
pub mod traits;


// Re-export commonly used items
pub use controller::{CoordinatorServices, QueryController};
pub use error::{CoordinatorError, CoordinatorResult};
pub use executor::{CallerExecutor, Executor, ExecutorConfig, ThreadPoolExecutor};
pub use memory::{MemoryPoolId, MemoryWatermarks, VersionedMemoryPoolId};
pub use output_publisher::{OutputPublisher, QueryOutputInfo};
pub use phase_timer::PhaseTimer;
pub use session::Session;
pub use snapshot::{
    BasicQueryInfo, BasicQueryStats, BasicStageStats, OperatorStats, PlanFragment, QueryInfo,
    QueryInput, QueryOutput, QueryStats, StageInfo, StageStats, TaskInfo,
};
pub use state_register::{StateRegister, StateValue};
pub use traits::{
    CleanupError, CleanupHandler, InMemoryTransactionManager, NoopCleanupHandler, RecoveryError,
    RecoveryManager, ResourceGroupManager, StackedWarningCollector, StaticRecoveryManager,
    StaticResourceGroupManager, TransactionError, TransactionManager, TransactionStatus,
    WarningCollector,
};
