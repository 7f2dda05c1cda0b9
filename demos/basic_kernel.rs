//! # Example: Basic Kernel
//!
//! Three modules in three stages:
//! - `metrics` (essential stage, background): flushes counters until stopped;
//! - `db` (service stage): becomes healthy after a short warm-up;
//! - `worker` (application stage): processes a few jobs, then returns.
//!
//! The worker is the only foreground module, so the kernel stops once it is done.
//! Run with `RUST_LOG=debug cargo run --example basic_kernel` to see stage boot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use modvisor::subscribers::{LogWriter, Subscribe};
use modvisor::{
    HealthCheckedModule, Kernel, KernelConfig, Module, ModuleError, ModuleFn, ModuleKind,
    ModuleOptions, ModuleRef, STAGE_ESSENTIAL, STAGE_SERVICE, StagedModule,
};

/// Pretends to connect to a database; healthy once warmed up.
struct Database {
    warm: AtomicBool,
}

#[async_trait]
impl Module for Database {
    async fn run(&self, ctx: CancellationToken) -> Result<(), ModuleError> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.warm.store(true, Ordering::SeqCst);
        tracing::info!("database warmed up");
        ctx.cancelled().await;
        Ok(())
    }

    fn as_staged(&self) -> Option<&dyn StagedModule> {
        Some(self)
    }

    fn as_health_checked(&self) -> Option<&dyn HealthCheckedModule> {
        Some(self)
    }
}

impl StagedModule for Database {
    fn stage(&self) -> i32 {
        STAGE_SERVICE
    }
}

#[async_trait]
impl HealthCheckedModule for Database {
    async fn is_healthy(&self) -> Result<bool, ModuleError> {
        Ok(self.warm.load(Ordering::SeqCst))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut cfg = KernelConfig::default();
    cfg.kill_timeout = Duration::from_secs(5);
    cfg.health_check.wait_interval = Duration::from_millis(100);

    let processed = Arc::new(AtomicU64::new(0));

    let kernel = Kernel::builder(cfg)
        .with_subscribers(vec![Arc::new(LogWriter::new()) as Arc<dyn Subscribe>])
        .with_module_options(
            "metrics",
            ModuleOptions::new()
                .kind(ModuleKind::Background)
                .stage(STAGE_ESSENTIAL),
            {
                let processed = Arc::clone(&processed);
                move |_ctx| {
                    Ok::<_, ModuleError>(ModuleFn::arc(move |ctx: CancellationToken| {
                        let processed = Arc::clone(&processed);
                        async move {
                            let mut tick = tokio::time::interval(Duration::from_millis(250));
                            loop {
                                tokio::select! {
                                    _ = ctx.cancelled() => return Ok::<_, ModuleError>(()),
                                    _ = tick.tick() => tracing::info!(
                                        processed = processed.load(Ordering::Relaxed),
                                        "metrics flushed"
                                    ),
                                }
                            }
                        }
                    }) as ModuleRef)
                }
            },
        )
        .with_module("db", |_ctx| {
            Ok::<_, ModuleError>(Arc::new(Database {
                warm: AtomicBool::new(false),
            }) as ModuleRef)
        })
        .with_module("worker", {
            let processed = Arc::clone(&processed);
            move |_ctx| {
                Ok::<_, ModuleError>(ModuleFn::arc(move |ctx: CancellationToken| {
                    let processed = Arc::clone(&processed);
                    async move {
                        for job in 1..=5 {
                            if ctx.is_cancelled() {
                                return Err(ModuleError::Canceled);
                            }
                            tokio::time::sleep(Duration::from_millis(200)).await;
                            processed.fetch_add(1, Ordering::Relaxed);
                            tracing::info!(job, "job processed");
                        }
                        Ok(())
                    }
                }) as ModuleRef)
            }
        })
        .with_exit_handler(|code| println!("kernel exited with {code}"))
        .build()?;

    let health = kernel.health_checker();
    let code = kernel.run().await;
    println!("healthy after exit: {}", health.check().await.is_healthy());

    std::process::exit(code.code());
}
