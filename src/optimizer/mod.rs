//! Sharded optimizer stack: AdamW, loss scaling, clipping, bucketing, and
//! the group-sharded core that ties them together.

pub mod adamw;
pub mod bucket;
pub mod grad_clip;
pub mod loss_scale;
pub mod sharded;

pub use adamw::{AdamW, AdamWConfig};
pub use bucket::GradientBucketManager;
pub use loss_scale::DynamicGradScaler;
pub use sharded::{
    ShardSpan, ShardedZeroOptimizer, StatePlacement, StepOutcome, ZeroOptimizerBuilder,
    ZeroOptimizerConfig,
};
