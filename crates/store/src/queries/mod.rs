//! Query methods on [`crate::Store`], grouped per entity.

mod agents;
mod messages;
mod rooms;
mod sessions;
