//! Example module archive
//!
//! Build with `cargo build -p sideload-demo` and copy the resulting shared
//! library into the sideload directory of a running `sideload run`.
//!
//! Three modules show the three ways a scope parent is chosen:
//! - `Clock` has no dependencies and hangs off the host root scope
//! - `Greeter` depends on `Clock` alone and is a child of its scope
//! - `Reporter` depends on both and gets a composite parent scope

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use sideload_kernel::{
    Binder, Module, ModuleDescriptor, ModuleError, ModuleResult, ModuleTypeId, RegistrationTable,
    Scope,
};
use tracing::info;

pub const CLOCK: &str = "sideload_demo::Clock";
pub const GREETER: &str = "sideload_demo::Greeter";
pub const REPORTER: &str = "sideload_demo::Reporter";

/// Tick rate published by [`Clock`] into every scope built from it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickRate(pub u64);

// ============================================================================
// Clock
// ============================================================================

/// Counts ticks
#[derive(Default)]
pub struct Clock {
    ticks: AtomicU64,
}

impl Clock {
    pub fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Module for Clock {
    fn configure(&self, binder: &mut Binder) -> ModuleResult<()> {
        binder.bind(TickRate(1_000))?;
        Ok(())
    }

    fn start_up(&self, _scope: &Arc<Scope>) -> ModuleResult<()> {
        info!("Clock started at tick {}", self.tick());
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Greeter
// ============================================================================

/// Greets with the current tick
#[derive(Default)]
pub struct Greeter {
    last: Mutex<Option<String>>,
}

impl Greeter {
    pub fn greet(&self, clock: &Clock) -> String {
        let greeting = format!("hello at tick {}", clock.tick());
        *self.last.lock() = Some(greeting.clone());
        greeting
    }

    pub fn last_greeting(&self) -> Option<String> {
        self.last.lock().clone()
    }
}

impl Module for Greeter {
    fn start_up(&self, scope: &Arc<Scope>) -> ModuleResult<()> {
        let clock = scope
            .module_as::<Clock>(&ModuleTypeId::new(CLOCK))
            .ok_or_else(|| ModuleError::StartupFailed("Clock not in scope".to_string()))?;
        info!("Greeter says {}", self.greet(clock));
        Ok(())
    }

    fn shut_down(&self) -> ModuleResult<()> {
        self.last.lock().take();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Reporter
// ============================================================================

/// Reads both other modules and the tick rate from its scope
#[derive(Default)]
pub struct Reporter {
    report: Mutex<Option<String>>,
}

impl Reporter {
    pub fn report(&self) -> Option<String> {
        self.report.lock().clone()
    }
}

impl Module for Reporter {
    fn start_up(&self, scope: &Arc<Scope>) -> ModuleResult<()> {
        let missing = |what: &str| ModuleError::StartupFailed(format!("{} not in scope", what));

        let clock = scope
            .module_as::<Clock>(&ModuleTypeId::new(CLOCK))
            .ok_or_else(|| missing("Clock"))?;
        let greeter = scope
            .module_as::<Greeter>(&ModuleTypeId::new(GREETER))
            .ok_or_else(|| missing("Greeter"))?;
        let rate = scope.get::<TickRate>().ok_or_else(|| missing("TickRate"))?;

        let report = format!(
            "{} (rate {}ms, last: {})",
            greeter.greet(clock),
            rate.0,
            greeter.last_greeting().unwrap_or_default()
        );
        info!("Reporter: {}", report);
        *self.report.lock() = Some(report);
        Ok(())
    }

    fn shut_down(&self) -> ModuleResult<()> {
        self.report.lock().take();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Registration
// ============================================================================

pub fn register(table: &mut RegistrationTable) {
    table
        .module::<Reporter>(
            REPORTER,
            ModuleDescriptor::new("Reporter")
                .with_description("Reports greetings and the clock rate")
                .with_version(env!("CARGO_PKG_VERSION"))
                .with_dependency(CLOCK)
                .with_dependency(GREETER),
        )
        .module::<Greeter>(
            GREETER,
            ModuleDescriptor::new("Greeter")
                .with_description("Greets with the current tick")
                .with_version(env!("CARGO_PKG_VERSION"))
                .with_dependency(CLOCK),
        )
        .module::<Clock>(
            CLOCK,
            ModuleDescriptor::new("Clock")
                .with_description("Counts ticks")
                .with_version(env!("CARGO_PKG_VERSION")),
        );
}

sideload_kernel::declare_modules!(register);
