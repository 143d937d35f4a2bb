use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// A retry schedule derived from a configured delay table.
///
/// An operation is attempted once plus once per configured delay. The
/// schedule is shared by the storage, database and messaging layers; each
/// names its own delay table in the configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
	delays: Vec<Duration>,
}

impl RetryPolicy {
	pub fn new(delays_ms: &[u64]) -> Self {
		Self {
			delays: delays_ms.iter().map(|ms| Duration::from_millis(*ms)).collect(),
		}
	}

	/// Number of attempts after the first, i.e. the retry cap.
	pub fn max_retries(&self) -> u32 {
		self.delays.len() as u32
	}

	/// Runs `operation` until it succeeds or the delay table is exhausted.
	///
	/// Every failed attempt is logged with the operation label before the
	/// corresponding delay elapses. The error of the final attempt is
	/// returned unchanged.
	pub async fn run<T, E, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, E>
	where
		E: std::fmt::Display,
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T, E>>,
	{
		let mut attempt: u32 = 0;
		loop {
			match operation().await {
				Ok(value) => return Ok(value),
				Err(err) => {
					let Some(delay) = self.delays.get(attempt as usize) else {
						warn!(operation = label, attempt, "Retries exhausted: {err}");
						return Err(err);
					};
					warn!(
						operation = label,
						attempt,
						delay_ms = delay.as_millis() as u64,
						"Attempt failed, retrying: {err}"
					);
					tokio::time::sleep(*delay).await;
					attempt += 1;
				}
			}
		}
	}
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self::new(&[250, 500, 1000])
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	#[tokio::test]
	async fn returns_first_success() {
		let policy = RetryPolicy::new(&[1, 1, 1]);
		let calls = AtomicU32::new(0);
		let result: Result<u32, &str> = policy
			.run("test", || {
				let n = calls.fetch_add(1, Ordering::SeqCst);
				async move {
					if n < 2 {
						Err("boom")
					} else {
						Ok(n)
					}
				}
			})
			.await;

		assert_eq!(result, Ok(2));
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn exhausts_delay_table() {
		let policy = RetryPolicy::new(&[1, 1]);
		let calls = AtomicU32::new(0);
		let result: Result<(), &str> = policy
			.run("test", || {
				calls.fetch_add(1, Ordering::SeqCst);
				async { Err("boom") }
			})
			.await;

		assert_eq!(result, Err("boom"));
		// one initial attempt + one per delay
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}
}
