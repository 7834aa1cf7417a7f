/// 网络管理
///
/// 支持 bridge / host / static / macvlan (segment_isolated) / none

pub mod planner;
pub mod procedure;

pub use planner::{NetworkPlan, NetworkPlanner};
pub use procedure::{SetupProcedure, SetupStep};
