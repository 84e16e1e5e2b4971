//! Input side of the recommender: change feeds, metrics sources and the
//! feeder that reconciles them into the cluster model.

pub mod feed;
pub mod feeder;
pub mod metrics;

pub use feed::{ClusterFeed, FeedEvent, FeedSnapshot, OomSender};
pub use feeder::{ClusterStateFeeder, FeederConfig, DEFAULT_RECOMMENDER_NAME};
