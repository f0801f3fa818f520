pub mod dispatch;
pub mod machine;
pub mod session;
pub mod store;

pub use dispatch::{DispatchReceipt, WorkflowDispatcher};
pub use machine::PublishSessions;
pub use session::{
    DispatchError, PublishError, PublishErrorInfo, PublishResult, PublishSession, PublishStatus,
    RunnerInfo, SessionStore, SessionStoreError,
};
