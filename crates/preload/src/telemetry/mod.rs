//! One-shot assembly of the tracing pipeline: resource, sampler, OTLP/gRPC
//! exporter, batch processor, global provider.

mod export;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use once_cell::sync::OnceCell;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{KeyValue, global};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracer, SdkTracerProvider};

use crate::registry::{self, CloseReason};
use crate::{guard, rawlog, symbols};

pub(crate) const SHIM_NAME: &str = "socktrace-preload";

#[derive(thiserror::Error, Debug)]
pub(crate) enum InitError {
	#[error("export runtime: {0}")]
	Runtime(#[from] std::io::Error),
	#[error("otlp exporter: {0}")]
	Exporter(#[from] opentelemetry_otlp::ExporterBuildError),
}

struct Pipeline {
	provider: SdkTracerProvider,
	tracer: SdkTracer,
	// keeps the export runtime's worker alive for the life of the process
	_runtime: Option<tokio::runtime::Runtime>,
}

static READY: AtomicBool = AtomicBool::new(false);
static PIPELINE: OnceCell<Option<Pipeline>> = OnceCell::new();

/// Idempotent, race-free pipeline setup; a single atomic load after the
/// first call. Invoked from the library constructor and defensively from
/// every hook. Callers must hold the reentrancy guard: building the exporter
/// spawns threads and performs I/O through the interposed symbols.
pub(crate) fn ensure_initialized() {
	if READY.load(Ordering::Acquire) {
		return;
	}
	PIPELINE.get_or_init(|| {
		symbols::resolve_all();
		let pipeline = match build_pipeline() {
			Ok(pipeline) => {
				rawlog::line("[socktrace] tracing initialized");
				Some(pipeline)
			}
			Err(err) => {
				// tracing stays off; the hooks keep forwarding to libc
				rawlog::line(&format!("[socktrace] tracing disabled: {err}"));
				None
			}
		};
		READY.store(true, Ordering::Release);
		pipeline
	});
}

/// The shim's tracer, or `None` when initialization failed and tracing is
/// disabled.
pub(crate) fn tracer() -> Option<&'static SdkTracer> {
	PIPELINE.get()?.as_ref().map(|pipeline| &pipeline.tracer)
}

fn build_pipeline() -> Result<Pipeline, InitError> {
	let runtime = tokio::runtime::Builder::new_multi_thread()
		.worker_threads(1)
		.thread_name("socktrace-export")
		.enable_all()
		.on_thread_start(guard::disarm_current_thread)
		.build()?;
	let exporter = {
		// endpoint, headers, timeout, and TLS all come from the standard
		// OTEL_EXPORTER_OTLP_* variables, handled by the builder
		let _rt = runtime.enter();
		opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.build()?
	};
	let exporter = export::OnRuntime::new(exporter, runtime.handle().clone());
	let provider = SdkTracerProvider::builder()
		.with_resource(resource())
		.with_sampler(sampler_from_env())
		.with_batch_exporter(exporter)
		.build();
	global::set_tracer_provider(provider.clone());
	let tracer = provider.tracer(SHIM_NAME);
	Ok(Pipeline {
		provider,
		tracer,
		_runtime: Some(runtime),
	})
}

fn resource() -> Resource {
	Resource::builder()
		.with_service_name(service_name())
		.with_attributes([
			KeyValue::new("telemetry.sdk.language", "rust"),
			KeyValue::new("telemetry.instrumentation_library", SHIM_NAME),
		])
		.build()
}

fn service_name() -> String {
	service_name_from(
		std::env::var("OTEL_SERVICE_NAME").ok(),
		std::fs::read_to_string("/proc/self/comm").ok(),
	)
}

fn service_name_from(env: Option<String>, comm: Option<String>) -> String {
	if let Some(name) = env
		&& !name.is_empty()
	{
		return name;
	}
	if let Some(comm) = comm {
		let comm = comm.trim();
		if !comm.is_empty() {
			return comm.to_string();
		}
	}
	"unknown-process".to_string()
}

fn sampler_from_env() -> Sampler {
	sampler_from(
		std::env::var("OTEL_TRACES_SAMPLER").ok().as_deref(),
		std::env::var("OTEL_TRACES_SAMPLER_ARG").ok().as_deref(),
	)
}

fn sampler_from(name: Option<&str>, arg: Option<&str>) -> Sampler {
	match name {
		Some("ratio") => {
			let ratio = arg
				.and_then(|raw| raw.parse::<f64>().ok())
				.filter(|ratio| ratio.is_finite())
				.unwrap_or(1.0)
				.clamp(0.0, 1.0);
			Sampler::TraceIdRatioBased(ratio)
		}
		_ => Sampler::AlwaysOn,
	}
}

/// Destructor-time teardown: close out connection spans that never saw their
/// `close`, then flush and shut the provider down, bounded by `deadline`.
#[cfg_attr(test, allow(dead_code))] // entered through the dtor, which tests compile out
pub(crate) fn shutdown(deadline: Duration) {
	let Some(Some(pipeline)) = PIPELINE.get() else {
		return;
	};
	let open = registry::global().len();
	if open > 0 {
		rawlog::line(&format!(
			"[socktrace] {open} connection span(s) still open at exit"
		));
	}
	registry::global().drain(CloseReason::Shutdown);
	let provider = pipeline.provider.clone();
	let (done_tx, done_rx) = mpsc::channel();
	let flusher = thread::Builder::new()
		.name("socktrace-flush".to_string())
		.spawn(move || {
			guard::disarm_current_thread();
			let _ = provider.force_flush();
			let _ = provider.shutdown();
			let _ = done_tx.send(());
		});
	if flusher.is_ok() {
		let _ = done_rx.recv_timeout(deadline);
	}
}
