//! Background services

pub mod feed_poller;

pub use feed_poller::{
    FeedEntry, FeedPoller, FeedPollerConfig, FeedPollerHandle, NewFeedEntry, RemovedEntries,
};
