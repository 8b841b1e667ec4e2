//! Weighted-ensemble population control with distribution-matching reweighting.
//!
//! Each iteration of a weighted-ensemble simulation hands the current walkers,
//! grouped into bins of progress-coordinate space, to a
//! [`controller::PopulationController`]. The controller optionally corrects
//! the walker weights so that their distribution matches a reference
//! distribution ([`reweight`]) and then splits and merges walkers until every
//! bin holds its target count, conserving the total weight.

pub mod bin;
pub mod config;
pub mod controller;
pub mod errors;
pub mod observer;
pub mod pdist;
pub mod python;
pub mod resample;
pub mod reweight;
pub mod subgroup;
pub mod walker;
