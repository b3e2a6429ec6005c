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

//! Admission limiter with a capacity that can change while slots are held.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::context::SearchContext;
use crate::error::ContextError;

/// Process-wide limiter for outbound archive searches. Resized before each
/// fan-out to `slots_per_endpoint * endpoints`.
pub static TEXT_SEARCH_LIMITER: Lazy<MutableLimiter> = Lazy::new(|| MutableLimiter::new(32));

#[derive(Debug)]
struct State {
    limit: usize,
    running: usize,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

/// A counting gate. Lowering the capacity never revokes held permits; it only
/// delays new admissions until enough permits are released.
#[derive(Debug, Clone)]
pub struct MutableLimiter {
    inner: Arc<Inner>,
}

impl MutableLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State { limit, running: 0 }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn set_limit(&self, limit: usize) {
        let grew = {
            let mut st = self.inner.state.lock();
            let grew = limit > st.limit;
            if st.limit != limit {
                tracing::debug!(from = st.limit, to = limit, "resizing admission limiter");
            }
            st.limit = limit;
            grew
        };
        if grew {
            self.inner.notify.notify_waiters();
        }
    }

    /// Current `(limit, running)`.
    pub fn get_limit(&self) -> (usize, usize) {
        let st = self.inner.state.lock();
        (st.limit, st.running)
    }

    /// Wait for a free slot. Fails only when `ctx` is done first.
    pub async fn acquire(&self, ctx: &SearchContext) -> Result<LimiterPermit, ContextError> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_admit() {
                return Ok(LimiterPermit {
                    inner: Arc::clone(&self.inner),
                });
            }
            ctx.run(notified.as_mut()).await?;
        }
    }

    fn try_admit(&self) -> bool {
        let mut st = self.inner.state.lock();
        if st.running < st.limit {
            st.running += 1;
            true
        } else {
            false
        }
    }
}

/// A held admission slot; released on drop.
#[derive(Debug)]
pub struct LimiterPermit {
    inner: Arc<Inner>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        {
            let mut st = self.inner.state.lock();
            st.running = st.running.saturating_sub(1);
        }
        self.inner.notify.notify_one();
    }
}
