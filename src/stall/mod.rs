//! Write stalls: admission decisions, delay policies and freeze triggers.

pub mod controller;
pub mod policy;
pub mod trigger;

pub use controller::{LoadMetrics, StallCause, StallCondition, StallMetrics, WriteController};
pub use policy::{DelayContext, DelayPolicy, LinearDelay, NoDelay, RateLimitedDelay};
pub use trigger::{FreezeTrigger, LengthTrigger, SizeOfMemTrigger, TriggerType};
