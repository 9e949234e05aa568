//! Test-plan, session, and result data model (spec §3).

pub mod plan;
pub mod result;
pub mod session;

pub use plan::{LimitType, ParameterValue, TestPlanItem, TestPointMap, TestPointState, ValueType};
pub use result::{ResultStatus, TestResult};
pub use session::{FinalResult, SessionStatus, TestSession};
