//! TCP stack telemetry for a connected socket.
//!
//! Values are read straight from the kernel and surfaced as-is.

use std::fmt;
use std::io;
use std::os::fd::AsRawFd;

/// Snapshot of the kernel's view of one TCP connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpTelemetry {
    /// Congestion window, in segments.
    pub cwnd: u32,
    /// Segments sent but not yet acknowledged.
    pub unacked: u32,
    pub reordering: u32,
    /// Retransmits of the current unacknowledged segment.
    pub retransmits: u8,
    pub total_retrans: u32,
    pub lost: u32,
    pub rtt_us: u32,
    pub rttvar_us: u32,
    /// Congestion-avoidance state (open, disorder, CWR, recovery, loss).
    pub ca_state: u8,
}

impl fmt::Display for TcpTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cwnd={} unacked={} reordering={} retransmits={} total_retrans={} lost={} rtt={}us rttvar={}us ca_state={}",
            self.cwnd,
            self.unacked,
            self.reordering,
            self.retransmits,
            self.total_retrans,
            self.lost,
            self.rtt_us,
            self.rttvar_us,
            self.ca_state
        )
    }
}

/// Sample `TCP_INFO` for `socket`.
#[cfg(target_os = "linux")]
pub fn sample<S: AsRawFd>(socket: &S) -> io::Result<TcpTelemetry> {
    let mut info = std::mem::MaybeUninit::<libc::tcp_info>::zeroed();
    let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;

    // SAFETY: `info` is a zeroed tcp_info and `len` holds its size; the
    // kernel writes at most `len` bytes.
    let rc = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            info.as_mut_ptr().cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: zero-initialised and possibly partially overwritten by the
    // kernel; every field is a plain integer.
    let info = unsafe { info.assume_init() };

    Ok(TcpTelemetry {
        cwnd: info.tcpi_snd_cwnd,
        unacked: info.tcpi_unacked,
        reordering: info.tcpi_reordering,
        retransmits: info.tcpi_retransmits,
        total_retrans: info.tcpi_total_retrans,
        lost: info.tcpi_lost,
        rtt_us: info.tcpi_rtt,
        rttvar_us: info.tcpi_rttvar,
        ca_state: info.tcpi_ca_state,
    })
}

#[cfg(not(target_os = "linux"))]
pub fn sample<S: AsRawFd>(_socket: &S) -> io::Result<TcpTelemetry> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "TCP_INFO is only available on Linux",
    ))
}
