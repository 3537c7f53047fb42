use std::future::Future;
use std::sync::Arc;

use opentelemetry_sdk::Resource;
use opentelemetry_sdk::error::{OTelSdkError, OTelSdkResult};
use opentelemetry_sdk::trace::{SpanData, SpanExporter};
use tokio::runtime::Handle;

use crate::guard;

/// OTLP/tonic span exporter pinned to the shim's private runtime. The SDK's
/// batch worker drives exports with a local executor that has no reactor, so
/// the gRPC future has to be handed to a real tokio runtime instead.
#[derive(Debug)]
pub(crate) struct OnRuntime {
	inner: Arc<opentelemetry_otlp::SpanExporter>,
	handle: Handle,
}

impl OnRuntime {
	pub(crate) fn new(inner: opentelemetry_otlp::SpanExporter, handle: Handle) -> OnRuntime {
		OnRuntime {
			inner: Arc::new(inner),
			handle,
		}
	}
}

impl SpanExporter for OnRuntime {
	fn export(&self, batch: Vec<SpanData>) -> impl Future<Output = OTelSdkResult> + Send {
		// Export runs on the batch worker's thread, and waking the runtime
		// writes to its internal pipe; none of that traffic may re-enter the
		// hooks.
		guard::disarm_current_thread();
		let inner = Arc::clone(&self.inner);
		let handle = self.handle.clone();
		async move {
			match handle.spawn(async move { inner.export(batch).await }).await {
				Ok(result) => result,
				Err(join) => Err(OTelSdkError::InternalFailure(join.to_string())),
			}
		}
	}

	fn shutdown(&mut self) -> OTelSdkResult {
		match Arc::get_mut(&mut self.inner) {
			Some(inner) => inner.shutdown(),
			// an export is still holding a reference; dropping ours is all
			// that is left to do
			None => Ok(()),
		}
	}

	fn set_resource(&mut self, resource: &Resource) {
		if let Some(inner) = Arc::get_mut(&mut self.inner) {
			inner.set_resource(resource);
		}
	}
}
