pub mod backfill;
pub mod disappearing;
pub mod event;
pub mod message;
pub mod reaction;
