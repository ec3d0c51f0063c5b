//! PathFast Network Layer
//!
//! Measurement and discovery primitives shared by the tunnel session
//! and the command line.
//!
//! # Components
//!
//! - **LatencyProbe**: echo-based round-trip prober over any [`Dialer`]
//! - **EchoServer**: diagnostic peer that mirrors every byte
//! - **SubnetScanner**: bounded-concurrency search for a free address
//! - **HttpClient** / **DnsResolver**: remote list fetching and host lookup

mod client;
mod dns;
mod echo;
mod probe;
mod scanner;
mod stats;

pub use client::{HttpClient, HttpClientConfig, HttpError, Response};
pub use dns::{DnsConfig, DnsError, DnsResolver, HostResolver, parse_ipv4_literal};
pub use echo::{EchoConfig, EchoError, EchoServer, EchoStats};
pub use probe::{
    BoxedStream, DEFAULT_TIMEOUT, Dialer, LatencyProbe, ProbeError, ProbeResult, ProbeStream,
    TcpDialer,
};
pub use scanner::{
    Pinger, ScanConfig, ScanError, SubnetScanner, SystemPinger, host_addresses, parse_received,
};
pub use stats::{Stats, StatsSummary};
