//! Exit-recovery strategy chain.
//!
//! No single technique works on every driver stack, so several independent
//! strategies are tried in priority order until one succeeds. Every
//! strategy's result, error or panic is recorded; none of them aborts the
//! chain.

pub mod native;
pub mod strategies;

use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::events::{RecoveryEvent, RecoveryObserver};

pub use native::{NativeRecoveryApi, UnavailableNativeApi};
pub use strategies::{
    NativeApiStrategy, ProtocolClientStrategy, RawControlStrategy, ToolAutoBootStrategy,
};

/// What one attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyOutcome {
    Succeeded(String),
    Failed(String),
}

/// One interchangeable recovery-exit technique.
pub trait ExitStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Try once. Errors are reported as this strategy's failure.
    fn attempt(&self, cancel: &CancelToken) -> anyhow::Result<StrategyOutcome>;
}

/// Record of one strategy run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyAttempt {
    pub strategy: String,
    pub success: bool,
    pub reason: String,
}

/// Aggregate result of a chain run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitReport {
    pub attempts: Vec<StrategyAttempt>,
    pub cancelled: bool,
}

impl ExitReport {
    pub fn succeeded(&self) -> bool {
        self.attempts.last().is_some_and(|a| a.success)
    }

    pub fn winner(&self) -> Option<&str> {
        self.attempts
            .iter()
            .find(|a| a.success)
            .map(|a| a.strategy.as_str())
    }

    /// `"<strategy>: <reason>"` for every failed attempt.
    pub fn failure_reasons(&self) -> Vec<String> {
        self.attempts
            .iter()
            .filter(|a| !a.success)
            .map(|a| format!("{}: {}", a.strategy, a.reason))
            .collect()
    }
}

/// Ordered list of strategies.
#[derive(Default)]
pub struct ExitChain {
    strategies: Vec<Box<dyn ExitStrategy>>,
}

impl ExitChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, strategy: impl ExitStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn push(&mut self, strategy: Box<dyn ExitStrategy>) {
        self.strategies.push(strategy);
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Try each strategy in order; stop at the first success.
    pub fn run(&self, cancel: &CancelToken, observer: &dyn RecoveryObserver) -> ExitReport {
        let mut report = ExitReport::default();

        for (index, strategy) in self.strategies.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let name = strategy.name().to_string();
            info!(strategy = %name, "Method {}: {}", index + 1, name);

            let (success, reason) =
                match catch_unwind(AssertUnwindSafe(|| strategy.attempt(cancel))) {
                    Ok(Ok(StrategyOutcome::Succeeded(detail))) => (true, detail),
                    Ok(Ok(StrategyOutcome::Failed(reason))) => (false, reason),
                    Ok(Err(e)) => (false, format!("{e:#}")),
                    Err(panic) => (false, format!("panicked: {}", panic_message(&*panic))),
                };

            if !success {
                warn!(strategy = %name, reason = %reason, "Strategy failed");
            }
            observer.on_event(&RecoveryEvent::StrategyAttempted {
                strategy: name.clone(),
                success,
                reason: reason.clone(),
            });
            report.attempts.push(StrategyAttempt {
                strategy: name,
                success,
                reason,
            });

            if success {
                break;
            }
        }

        report
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behavior {
        Succeed,
        Fail,
        Error,
        Panic,
    }

    struct Counting {
        name: String,
        behavior: Behavior,
        calls: Arc<AtomicUsize>,
    }

    impl ExitStrategy for Counting {
        fn name(&self) -> &str {
            &self.name
        }

        fn attempt(&self, _cancel: &CancelToken) -> anyhow::Result<StrategyOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed => Ok(StrategyOutcome::Succeeded("done".into())),
                Behavior::Fail => Ok(StrategyOutcome::Failed("no device".into())),
                Behavior::Error => anyhow::bail!("tool crashed"),
                Behavior::Panic => panic!("driver exploded"),
            }
        }
    }

    fn chain(behaviors: Vec<Behavior>) -> (ExitChain, Vec<Arc<AtomicUsize>>) {
        let mut chain = ExitChain::new();
        let mut counters = Vec::new();
        for (i, behavior) in behaviors.into_iter().enumerate() {
            let calls = Arc::new(AtomicUsize::new(0));
            counters.push(calls.clone());
            chain.push(Box::new(Counting {
                name: format!("s{}", i + 1),
                behavior,
                calls,
            }));
        }
        (chain, counters)
    }

    #[test]
    fn test_short_circuits_on_success() {
        let (chain, counters) = chain(vec![
            Behavior::Fail,
            Behavior::Succeed,
            Behavior::Succeed,
            Behavior::Fail,
        ]);
        let report = chain.run(&CancelToken::new(), &NullObserver);

        assert!(report.succeeded());
        assert_eq!(report.winner(), Some("s2"));
        let calls: Vec<usize> = counters.iter().map(|c| c.load(Ordering::SeqCst)).collect();
        assert_eq!(calls, vec![1, 1, 0, 0]);
    }

    #[test]
    fn test_all_failing_aggregates_every_reason() {
        let (chain, counters) = chain(vec![
            Behavior::Fail,
            Behavior::Error,
            Behavior::Panic,
            Behavior::Fail,
        ]);
        let report = chain.run(&CancelToken::new(), &NullObserver);

        assert!(!report.succeeded());
        let reasons = report.failure_reasons();
        assert_eq!(reasons.len(), 4);
        assert_eq!(reasons[1], "s2: tool crashed");
        assert!(reasons[2].contains("driver exploded"));
        assert!(counters.iter().all(|c| c.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_cancelled_chain_runs_nothing() {
        let (chain, counters) = chain(vec![Behavior::Succeed]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let report = chain.run(&cancel, &NullObserver);
        assert!(report.cancelled);
        assert!(report.attempts.is_empty());
        assert_eq!(counters[0].load(Ordering::SeqCst), 0);
    }
}
