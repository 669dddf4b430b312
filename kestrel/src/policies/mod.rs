//! This module holds policies, which are entities that allow configuring
//! the driver's behaviour in various aspects. Users can implement a policy
//! on their own by implementing its trait.

pub mod retry;
