//! # nftables classification
//!
//! [`NftClassifier`] implements [`cgt_rules::Classifier`] on top of an `inet` nftables table.
//! Every change is rendered as an nftables script and applied with `nft -f -`, so each one is a
//! single transaction.
//!
//! The resulting table looks like this (with one tproxy on mark `0xbb8`, port 7893):
//!
//! ```text
//! table inet cgtproxy {
//!     set bypass4 { type ipv4_addr; flags interval; elements = { 127.0.0.0/8 } }
//!     set bypass6 { type ipv6_addr; flags interval; }
//!
//!     chain prerouting {
//!         type filter hook prerouting priority mangle; policy accept;
//!         meta mark 0xbb8 meta l4proto tcp tproxy to :7893 accept
//!         meta mark 0xbb8 meta l4proto udp tproxy to :7893 accept
//!     }
//!
//!     chain output {
//!         type route hook output priority mangle; policy accept;
//!         ip daddr @bypass4 return
//!         ip6 daddr @bypass6 return
//!         fib daddr type local return
//!         jump cgroups
//!     }
//!
//!     chain cgroups {
//!         socket cgroupv2 level 2 "user.slice/user-1000.slice" meta l4proto { tcp, udp } meta mark set 0xbb8 accept
//!     }
//! }
//! ```

mod classifier;
pub mod command;
pub mod script;

pub use classifier::{Error, NftClassifier};
pub use command::{Nft, ScriptRunner};
