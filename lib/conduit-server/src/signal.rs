//! Termination signals and their exit codes

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationSignal {
    Hangup,
    Interrupt,
    Quit,
    Terminate,
}

impl TerminationSignal {
    /// Process exit status after cleanup; the signal number
    pub fn exit_code(&self) -> i32 {
        match self {
            TerminationSignal::Hangup => 1,
            TerminationSignal::Interrupt => 2,
            TerminationSignal::Quit => 3,
            TerminationSignal::Terminate => 15,
        }
    }
}

impl fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TerminationSignal::Hangup => "SIGHUP",
            TerminationSignal::Interrupt => "SIGINT",
            TerminationSignal::Quit => "SIGQUIT",
            TerminationSignal::Terminate => "SIGTERM",
        };
        f.write_str(name)
    }
}

/// Wait for the first of SIGINT, SIGTERM, SIGHUP or SIGQUIT
#[cfg(unix)]
pub async fn wait_for_termination() -> std::io::Result<TerminationSignal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let received = tokio::select! {
        _ = hangup.recv() => TerminationSignal::Hangup,
        _ = interrupt.recv() => TerminationSignal::Interrupt,
        _ = quit.recv() => TerminationSignal::Quit,
        _ = terminate.recv() => TerminationSignal::Terminate,
    };
    Ok(received)
}

#[cfg(not(unix))]
pub async fn wait_for_termination() -> std::io::Result<TerminationSignal> {
    tokio::signal::ctrl_c().await?;
    Ok(TerminationSignal::Interrupt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_match_signal_numbers() {
        assert_eq!(TerminationSignal::Hangup.exit_code(), 1);
        assert_eq!(TerminationSignal::Interrupt.exit_code(), 2);
        assert_eq!(TerminationSignal::Quit.exit_code(), 3);
        assert_eq!(TerminationSignal::Terminate.exit_code(), 15);
        assert_eq!(TerminationSignal::Terminate.to_string(), "SIGTERM");
    }
}
