pub mod error;
pub mod model;
pub mod ports;

pub use error::{FaultClass, SyncError};
pub use model::{
    AggregatedMembership, ContinuationToken, GroupId, JobId, MemberId, MembershipPage, QueryPart,
    RunCursor, SourceRef, SyncJob, SyncQuery, SyncStatus,
};
pub use ports::{
    BlobStore, DownstreamAck, DownstreamAggregator, JobRepository, MembershipReady, MessageKind,
    NotificationSink, SourceDirectory,
};
