//! Environment abstraction for deterministic testing.
//!
//! Decouples protocol logic from system resources (wall clock, randomness).
//! Production uses the OS clock and RNG; tests use [`test_utils::MockEnv`]
//! with a settable clock and a seeded RNG.

use std::time::Duration;

/// Abstract environment providing time, randomness, and async sleeping.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - `wall_clock_secs()` is the Unix time used for every expiry check
pub trait Environment: Clone + Send + Sync + 'static {
    /// Current Unix time in seconds.
    ///
    /// Key packages and discovery requests carry absolute expiry timestamps,
    /// so this is the only clock protocol logic reads.
    fn wall_clock_secs(&self) -> u64;

    /// Sleeps for the specified duration.
    ///
    /// Only driver code (periodic sweeps) uses this, never protocol logic.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random 32-byte array (key seeds).
    fn random_array(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        self.random_bytes(&mut bytes);
        bytes
    }
}

/// Test environment.
pub mod test_utils {
    #![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]
    #![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

    use std::{
        sync::{
            Arc, Mutex,
            atomic::{AtomicU64, Ordering},
        },
        time::Duration,
    };

    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    use super::Environment;

    /// Default wall clock (2023-11-14T22:13:20Z).
    pub const DEFAULT_WALL_CLOCK: u64 = 1_700_000_000;

    /// Deterministic environment.
    ///
    /// Clones share the clock and RNG, so advancing time through one handle is
    /// visible through all of them.
    #[derive(Clone)]
    pub struct MockEnv {
        rng: Arc<Mutex<ChaCha20Rng>>,
        clock: Arc<AtomicU64>,
    }

    impl Default for MockEnv {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockEnv {
        /// Environment seeded with 0.
        pub fn new() -> Self {
            Self::with_seed(0)
        }

        /// Environment with a specific RNG seed.
        pub fn with_seed(seed: u64) -> Self {
            Self {
                rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
                clock: Arc::new(AtomicU64::new(DEFAULT_WALL_CLOCK)),
            }
        }

        /// Set the wall clock.
        pub fn set_wall_clock(&self, secs: u64) {
            self.clock.store(secs, Ordering::SeqCst);
        }

        /// Move the wall clock forward.
        pub fn advance(&self, secs: u64) {
            self.clock.fetch_add(secs, Ordering::SeqCst);
        }
    }

    impl Environment for MockEnv {
        fn wall_clock_secs(&self) -> u64 {
            self.clock.load(Ordering::SeqCst)
        }

        fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            tokio::time::sleep(duration)
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            self.rng.lock().expect("MockEnv rng mutex poisoned").fill_bytes(buffer);
        }
    }
}
