use std::time::Duration;

use crate::bus::{attach, BusConfig, BusConnection};
use crate::end::{establish, linked_pair, ClosePolicy, EndOptions};
use crate::error::BusResult;
use crate::handshake::{Role, DEFAULT_TIMEOUT};
use crate::port::Port;

/// Options shared by the connection factories.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Deadline for the handshake and, separately, for the protocol
    /// agreement. `None` means the 60 second default.
    pub timeout: Option<Duration>,
    /// Per-call timeout. `None` inherits the connection timeout; an
    /// explicit `Duration::ZERO` disables per-call timeouts entirely,
    /// leaving only the connection-level ones.
    pub call_timeout: Option<Duration>,
    /// Side effect applied to the transport when this side closes.
    pub close_policy: ClosePolicy,
}

impl ConnectOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    fn connection_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }

    fn effective_call_timeout(&self) -> Option<Duration> {
        match self.call_timeout {
            None => Some(self.connection_timeout()),
            Some(timeout) if timeout.is_zero() => None,
            Some(timeout) => Some(timeout),
        }
    }
}

/// Connect over a transport: handshake, then protocol agreement, then
/// live RPC in both directions.
///
/// Exactly one side must pass [`Role::Active`]. The active side is the one
/// that knows it must initiate, conventionally the side that was just
/// spawned; its peer connects with [`Role::Passive`]. Establishment
/// failures are terminal: the endpoint is closed and the error returned,
/// and the caller retries by connecting again.
pub async fn connect<P: Port>(
    role: Role,
    port: P,
    config: BusConfig,
    options: ConnectOptions,
) -> BusResult<BusConnection> {
    let end_options = EndOptions {
        timeout: options.timeout,
        close_policy: options.close_policy,
    };
    let established = establish(port, role, end_options).await?;
    attach(
        role,
        established,
        config,
        options.connection_timeout(),
        options.effective_call_timeout(),
    )
    .await
}

/// Connect two sides living in the same process over the in-context
/// shortcut backend. No handshake runs; protocol agreement still does.
/// Closing either connection closes both.
pub async fn connect_pair(
    active_config: BusConfig,
    passive_config: BusConfig,
    options: ConnectOptions,
) -> BusResult<(BusConnection, BusConnection)> {
    let (a, b) = linked_pair();
    let timeout = options.connection_timeout();
    let call_timeout = options.effective_call_timeout();
    let (active, passive) = tokio::join!(
        attach(Role::Active, a, active_config, timeout, call_timeout),
        attach(Role::Passive, b, passive_config, timeout, call_timeout),
    );
    Ok((active?, passive?))
}
