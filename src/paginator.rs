//! Retrying wrapper around the remote membership-listing API.
//!
//! Every call is bounded by a caller-supplied timeout and the shared
//! [`RetryPolicy`]; exceeding the timeout counts as a transient fault.
//! The paginator makes no termination decisions of its own: it hands pages
//! back and the reader stops when a page carries no continuation token.

use std::time::Duration;

use groupsync_common::{ContinuationToken, MembershipPage, SourceRef, SyncError};

use crate::retry::RetryPolicy;

pub struct Paginator<'a> {
    directory: &'a dyn groupsync_common::SourceDirectory,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl<'a> Paginator<'a> {
    pub fn new(
        directory: &'a dyn groupsync_common::SourceDirectory,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            retry,
            call_timeout,
        }
    }

    pub async fn exists(&self, source: &SourceRef) -> Result<bool, SyncError> {
        self.retry
            .execute("exists", || {
                self.bounded("exists", self.directory.exists(source))
            })
            .await
    }

    pub async fn first_page(&self, source: &SourceRef) -> Result<MembershipPage, SyncError> {
        self.retry
            .execute("first_page", || {
                self.bounded("first_page", self.directory.first_page(source))
            })
            .await
    }

    pub async fn next_page(
        &self,
        token: &ContinuationToken,
    ) -> Result<MembershipPage, SyncError> {
        self.retry
            .execute("next_page", || {
                self.bounded("next_page", self.directory.next_page(token))
            })
            .await
    }

    async fn bounded<T>(
        &self,
        what: &str,
        fut: impl std::future::Future<Output = Result<T, SyncError>>,
    ) -> Result<T, SyncError> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout {
                what: what.to_string(),
                millis: self.call_timeout.as_millis() as u64,
            }),
        }
    }
}
