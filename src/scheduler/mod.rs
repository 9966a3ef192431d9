pub mod factory;
pub mod queue;
pub mod work_unit;

pub use factory::build_work_queue;
pub use queue::WorkQueue;
pub use work_unit::WorkUnit;
