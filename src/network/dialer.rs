// TCP dialer that enforces a target IP policy
// Every resolved address is validated before a socket connects to it

use std::net::SocketAddr;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::{debug, warn};

use super::{NetworkError, Result, TargetIpValidator};

/// Stream dialer that refuses targets rejected by its validator
#[derive(Clone)]
pub struct ValidatingDialer {
    validator: TargetIpValidator,
    fwmark: u32,
}

impl ValidatingDialer {
    /// Create a dialer.
    ///
    /// `fwmark` sets `SO_MARK` on outgoing sockets for policy routing; 0
    /// disables it. A non-zero mark on a platform other than Linux is a
    /// configuration error.
    pub fn new(validator: TargetIpValidator, fwmark: u32) -> Result<Self> {
        #[cfg(not(target_os = "linux"))]
        if fwmark != 0 {
            return Err(NetworkError::FwmarkUnsupported(fwmark));
        }

        Ok(Self { validator, fwmark })
    }

    pub fn fwmark(&self) -> u32 {
        self.fwmark
    }

    /// Resolve `addr` (host:port) and connect to the first acceptable target
    pub async fn dial(&self, addr: &str) -> Result<TcpStream> {
        let targets: Vec<SocketAddr> = lookup_host(addr)
            .await
            .map_err(|source| NetworkError::Resolve {
                addr: addr.to_string(),
                source,
            })?
            .collect();

        let mut last_error = NetworkError::NoAddresses(addr.to_string());
        for target in targets {
            match self.dial_target(target).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    if !matches!(e, NetworkError::TargetRejected { .. }) {
                        warn!(%target, error = %e, "connect failed");
                    }
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn dial_target(&self, target: SocketAddr) -> Result<TcpStream> {
        if let Err(reason) = (self.validator)(target.ip()) {
            debug!(%target, %reason, "target rejected");
            return Err(NetworkError::TargetRejected {
                ip: target.ip(),
                reason,
            });
        }

        let socket = if target.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        #[cfg(target_os = "linux")]
        if self.fwmark != 0 {
            set_fwmark(&socket, self.fwmark)?;
        }

        Ok(socket.connect(target).await?)
    }
}

impl std::fmt::Debug for ValidatingDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatingDialer")
            .field("fwmark", &self.fwmark)
            .finish_non_exhaustive()
    }
}

/// Apply SO_MARK (needs CAP_NET_ADMIN)
#[cfg(target_os = "linux")]
fn set_fwmark(socket: &TcpSocket, fwmark: u32) -> Result<()> {
    use libc::{c_void, setsockopt, socklen_t, SOL_SOCKET, SO_MARK};
    use std::os::fd::AsRawFd;

    let value = fwmark;
    let ret = unsafe {
        setsockopt(
            socket.as_raw_fd(),
            SOL_SOCKET,
            SO_MARK,
            &value as *const u32 as *const c_void,
            std::mem::size_of::<u32>() as socklen_t,
        )
    };

    if ret != 0 {
        return Err(NetworkError::Fwmark {
            fwmark,
            source: std::io::Error::last_os_error(),
        });
    }

    Ok(())
}
