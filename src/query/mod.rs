pub mod compiler;
pub mod descriptor;
pub mod period;

pub use compiler::{compile, CompiledQuery, PlanSource, PlanState};
pub use descriptor::{Filter, FilterOp, OrderDirection, QueryDescriptor, TimeDimension};
pub use period::{DateRange, Granularity, Period};
