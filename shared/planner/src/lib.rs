//! Elastic 3D-parallelism planner: given a baseline data/tensor/pipeline-parallel degree and
//! live per-device straggler ratios, searches for pipeline layouts that route around slow
//! devices and returns the top-k candidates ranked by predicted makespan.
//!
//! The pipeline runs in five stages, each in its own module: [`device`] classifies and
//! partitions the candidate device pool, [`tp_group`] carves tensor-parallel groups out of
//! it, [`pp_enumerate`] enumerates candidate pipeline templates, [`ilp`] solves the two
//! per-template integer programs, and [`placer`] fills in the remaining groups and keeps the
//! best plans. [`model::make_plans`] wires all five together.

mod config_tree;
mod ctxs;
mod device;
mod error;
mod ilp;
mod model;
mod placer;
mod pp_enumerate;
mod tp_group;


pub use config_tree::{ConfigNode, GptConfigGenerator, ParallelConfigGenerator};
pub use ctxs::{PlanStrategyArgs, TrainerCtxs, TrainerStrategyArgs};
pub use device::DeviceStatusSet;
pub use error::PlannerError;
pub use model::{approx_equal, make_plans, PlannerCache};
pub use placer::{Pipeline, Plan};
pub use tp_group::TpGroup;
