use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Lifecycle state of a background component, surfaced by the health API.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum ComponentStatus {
	Unknown,
	Running,
	Stopped,
	Cancelled,
}

/// A long-running background service.
///
/// `run` should only return once the work is done or the token fires;
/// the orchestrator owns spawning and status bookkeeping.
#[async_trait]
pub trait Component: Send + Sync + 'static {
	fn name(&self) -> &'static str;
	async fn run(self: Arc<Self>, token: CancellationToken) -> anyhow::Result<()>;
}

struct Registered {
	name: &'static str,
	status: Arc<Mutex<ComponentStatus>>,
	handle: JoinHandle<()>,
}

/// Starts components in registration (dependency) order and stops them in
/// reverse, each under a child of the root cancellation token.
pub struct Orchestrator {
	root: CancellationToken,
	components: Mutex<Vec<Registered>>,
}

impl Orchestrator {
	pub fn new(root: CancellationToken) -> Self {
		Self {
			root,
			components: Mutex::new(Vec::new()),
		}
	}

	pub fn root_token(&self) -> CancellationToken {
		self.root.clone()
	}

	pub fn start(&self, component: Arc<dyn Component>) {
		let name = component.name();
		let token = self.root.child_token();
		let status = Arc::new(Mutex::new(ComponentStatus::Unknown));

		let task_status = Arc::clone(&status);
		let task_token = token.clone();
		let handle = tokio::spawn(async move {
			*task_status.lock().unwrap() = ComponentStatus::Running;
			info!(component = name, "Component started");

			let result = Arc::clone(&component).run(task_token.clone()).await;

			let terminal = if task_token.is_cancelled() {
				ComponentStatus::Cancelled
			} else {
				ComponentStatus::Stopped
			};
			*task_status.lock().unwrap() = terminal;

			match result {
				Ok(()) => info!(component = name, status = ?terminal, "Component exited"),
				Err(err) => error!(component = name, "Component failed: {err:#}"),
			}
		});

		self.components.lock().unwrap().push(Registered {
			name,
			status,
			handle,
		});
	}

	pub fn statuses(&self) -> Vec<(&'static str, ComponentStatus)> {
		self.components
			.lock()
			.unwrap()
			.iter()
			.map(|c| (c.name, *c.status.lock().unwrap()))
			.collect()
	}

	pub fn all_running(&self) -> bool {
		self.components
			.lock()
			.unwrap()
			.iter()
			.all(|c| *c.status.lock().unwrap() == ComponentStatus::Running)
	}

	/// Cancels the root token and awaits components in reverse start order.
	/// Components still running after `grace` are abandoned.
	pub async fn stop(&self, grace: Duration) {
		self.root.cancel();

		let components: Vec<Registered> = {
			let mut components = self.components.lock().unwrap();
			components.drain(..).collect()
		};

		for registered in components.into_iter().rev() {
			match tokio::time::timeout(grace, registered.handle).await {
				Ok(Ok(())) => {}
				Ok(Err(join_err)) => {
					error!(component = registered.name, "Component panicked: {join_err}");
				}
				Err(_) => {
					warn!(
						component = registered.name,
						grace_ms = grace.as_millis() as u64,
						"Component did not stop within the grace period"
					);
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct Idle;

	#[async_trait]
	impl Component for Idle {
		fn name(&self) -> &'static str {
			"idle"
		}

		async fn run(self: Arc<Self>, token: CancellationToken) -> anyhow::Result<()> {
			token.cancelled().await;
			Ok(())
		}
	}

	#[tokio::test]
	async fn reports_running_then_drains_on_stop() {
		let orchestrator = Orchestrator::new(CancellationToken::new());
		orchestrator.start(Arc::new(Idle));

		tokio::time::sleep(Duration::from_millis(50)).await;
		assert!(orchestrator.all_running());
		assert_eq!(orchestrator.statuses()[0], ("idle", ComponentStatus::Running));

		orchestrator.stop(Duration::from_secs(1)).await;
		assert!(orchestrator.statuses().is_empty());
		assert!(orchestrator.root_token().is_cancelled());
	}
}
