// Copyright 2025 the tidenet authors
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

use std::time::Instant;

use tokio::sync::broadcast;

/// One subscriber's view of the server-wide shutdown broadcast.
///
/// The receiver is surrendered the moment the signal is observed, so every
/// later `recv` resolves at once, and `observed_at` records when teardown
/// reached this subscriber.
#[derive(Debug)]
pub struct Shutdown {
    notify: Option<broadcast::Receiver<()>>,
    observed_at: Option<Instant>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            notify: Some(notify),
            observed_at: None,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.notify.is_none()
    }

    /// When this subscriber saw the signal, if it has.
    pub fn observed_at(&self) -> Option<Instant> {
        self.observed_at
    }

    /// Waits for the broadcast. Dropping the future mid-wait leaves the
    /// subscription intact.
    pub async fn recv(&mut self) {
        if let Some(notify) = self.notify.as_mut() {
            let _ = notify.recv().await;
            self.notify = None;
            self.observed_at = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_latches_after_first_signal() {
        let (tx, rx) = broadcast::channel(1);
        let mut shutdown = Shutdown::new(rx);
        assert!(!shutdown.is_shutdown());
        assert!(shutdown.observed_at().is_none());

        tx.send(()).unwrap();
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());
        assert!(shutdown.observed_at().is_some());

        // resolves immediately from here on
        shutdown.recv().await;
    }
}
