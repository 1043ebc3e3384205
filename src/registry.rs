//! Compile-time monitor registry.
//!
//! A fixed factory table maps each monitor name to its constructor, so the
//! supervisor needs no runtime reflection: `-m` names and config sections
//! are resolved against [`MONITOR_NAMES`], and [`REGISTRY`] builds the
//! boxed monitors.

/// All registered monitor names, in startup order.
pub const MONITOR_NAMES: &[&str] = &[
    "exec",
    "func",
    "syscall",
    "bio",
    "open",
    "interrupt",
    "page_fault",
    "context_switch",
];

#[cfg(feature = "bpf")]
pub use self::factory::{lookup, MonitorFactory, REGISTRY};

#[cfg(feature = "bpf")]
mod factory {
    use std::sync::Arc;

    use crate::capability::CapabilityReport;
    use crate::clock::MonotonicClock;
    use crate::config::Config;
    use crate::monitor::{
        bio::BioMonitor, context_switch::ContextSwitchMonitor, exec::ExecMonitor,
        func::FuncMonitor, interrupt::InterruptMonitor, open::OpenMonitor,
        page_fault::PageFaultMonitor, syscall::SyscallMonitor, Monitor,
    };

    type BuildFn = fn(&Config, &Arc<CapabilityReport>, MonotonicClock) -> Box<dyn Monitor>;

    /// One registry entry.
    pub struct MonitorFactory {
        pub name: &'static str,
        pub build: BuildFn,
    }

    pub const REGISTRY: &[MonitorFactory] = &[
        MonitorFactory {
            name: "exec",
            build: |cfg, caps, clock| {
                Box::new(ExecMonitor::new(
                    cfg.monitors.exec.clone(),
                    cfg.targets.clone(),
                    Arc::clone(caps),
                    clock,
                ))
            },
        },
        MonitorFactory {
            name: "func",
            build: |cfg, caps, clock| {
                Box::new(FuncMonitor::new(
                    cfg.monitors.func.clone(),
                    cfg.targets.clone(),
                    Arc::clone(caps),
                    clock,
                ))
            },
        },
        MonitorFactory {
            name: "syscall",
            build: |cfg, caps, clock| {
                Box::new(SyscallMonitor::new(
                    cfg.monitors.syscall.clone(),
                    cfg.targets.clone(),
                    Arc::clone(caps),
                    clock,
                ))
            },
        },
        MonitorFactory {
            name: "bio",
            build: |cfg, caps, clock| {
                Box::new(BioMonitor::new(
                    cfg.monitors.bio.clone(),
                    cfg.targets.clone(),
                    Arc::clone(caps),
                    clock,
                ))
            },
        },
        MonitorFactory {
            name: "open",
            build: |cfg, caps, clock| {
                Box::new(OpenMonitor::new(
                    cfg.monitors.open.clone(),
                    cfg.targets.clone(),
                    Arc::clone(caps),
                    clock,
                ))
            },
        },
        MonitorFactory {
            name: "interrupt",
            build: |cfg, caps, clock| {
                Box::new(InterruptMonitor::new(
                    cfg.monitors.interrupt.clone(),
                    cfg.targets.clone(),
                    Arc::clone(caps),
                    clock,
                ))
            },
        },
        MonitorFactory {
            name: "page_fault",
            build: |cfg, caps, clock| {
                Box::new(PageFaultMonitor::new(
                    cfg.monitors.page_fault.clone(),
                    cfg.targets.clone(),
                    Arc::clone(caps),
                    clock,
                ))
            },
        },
        MonitorFactory {
            name: "context_switch",
            build: |cfg, caps, clock| {
                Box::new(ContextSwitchMonitor::new(
                    cfg.monitors.context_switch.clone(),
                    cfg.targets.clone(),
                    Arc::clone(caps),
                    clock,
                ))
            },
        },
    ];

    /// Find a factory by name.
    pub fn lookup(name: &str) -> Option<&'static MonitorFactory> {
        REGISTRY.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_unique() {
        for (i, a) in MONITOR_NAMES.iter().enumerate() {
            for b in &MONITOR_NAMES[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[cfg(feature = "bpf")]
    #[test]
    fn test_registry_covers_all_names() {
        assert_eq!(REGISTRY.len(), MONITOR_NAMES.len());
        for name in MONITOR_NAMES {
            assert!(lookup(name).is_some(), "missing factory for {name}");
        }
        assert!(lookup("netio").is_none());
    }
}
