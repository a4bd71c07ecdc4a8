//! Named health checks served under `/healthz`.

use std::fmt::Write as _;
use std::sync::Arc;

/// A named, synchronous health check.
pub trait HealthzChecker: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self) -> Result<(), String>;
}

/// Always-healthy check proving the server answers at all.
pub struct PingHealthz;

impl HealthzChecker for PingHealthz {
    fn name(&self) -> &str {
        "ping"
    }

    fn check(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Check backed by an arbitrary closure.
pub struct NamedCheck<F> {
    name: String,
    check: F,
}

impl<F> NamedCheck<F>
where
    F: Fn() -> Result<(), String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }
}

impl<F> HealthzChecker for NamedCheck<F>
where
    F: Fn() -> Result<(), String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self) -> Result<(), String> {
        (self.check)()
    }
}

/// Run every check and render the aggregate report. Returns whether all
/// checks passed along with the body to send.
pub fn aggregate(checks: &[Arc<dyn HealthzChecker>], verbose: bool) -> (bool, String) {
    let mut ok = true;
    let mut report = String::new();

    for check in checks {
        match check.check() {
            Ok(()) => {
                let _ = writeln!(report, "[+]{} ok", check.name());
            }
            Err(reason) => {
                ok = false;
                let _ = writeln!(report, "[-]{} failed: {}", check.name(), reason);
            }
        }
    }

    if ok && !verbose {
        return (true, "ok".to_string());
    }

    if ok {
        report.push_str("healthz check passed\n");
    } else {
        report.push_str("healthz check failed\n");
    }
    (ok, report)
}
