// Copyright 2025 HyperZoekt Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Deadline and cancellation handling for one search.
//!
//! A [`SearchContext`] carries a cancellation token, an optional deadline and
//! the request metadata (actor, tracing span) that every collaborator call
//! needs. Cancellation flows one way: cancelling a derived context never
//! affects its parent.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::ContextError;

/// The authenticated identity a search runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub uid: i32,
    pub internal: bool,
}

impl Actor {
    pub fn user(uid: i32) -> Self {
        Self {
            uid,
            internal: false,
        }
    }

    pub fn internal() -> Self {
        Self {
            uid: 0,
            internal: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    actor: Option<Actor>,
    span: tracing::Span,
}

impl Default for SearchContext {
    fn default() -> Self {
        Self::background()
    }
}

impl SearchContext {
    /// A root context: never cancelled by anyone else, no deadline.
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            actor: None,
            span: tracing::Span::none(),
        }
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn actor(&self) -> Option<&Actor> {
        self.actor.as_ref()
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Derived context sharing the deadline; cancelling it leaves `self` alone.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            actor: self.actor.clone(),
            span: self.span.clone(),
        }
    }

    /// Derived context whose deadline is the earlier of the current one and
    /// `now + timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut ctx = self.child();
        ctx.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        ctx
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Why the context is done, if it is.
    pub fn err(&self) -> Option<ContextError> {
        if self.cancel.is_cancelled() {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => ContextError::Canceled,
                _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                self.cancel.cancelled().await;
                ContextError::Canceled
            }
        }
    }

    /// Drive `fut` until it completes or the context is done.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, ContextError> {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }

    /// Context that ignores the deadline of `self` but still observes its
    /// explicit cancellation.
    ///
    /// The returned context is built fresh: the actor and span are copied
    /// across explicitly. Dropping the guard cancels the returned context.
    pub fn without_deadline(&self) -> (SearchContext, DropGuard) {
        let cancel = self.cancel.child_token();
        let guard = cancel.clone().drop_guard();
        let ctx = SearchContext {
            cancel,
            deadline: None,
            actor: self.actor.clone(),
            span: self.span.clone(),
        };
        (ctx, guard)
    }
}
