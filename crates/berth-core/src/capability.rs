//! Linux capability management for least-privilege execution.
//!
//! The container keeps only the capabilities named in its configuration:
//! everything else is removed from the bounding set, and the effective,
//! permitted, and inheritable sets are replaced with the allowlist.

use std::fmt;
use std::str::FromStr;

use berth_common::error::{BerthError, Result};
use serde::{Deserialize, Serialize};

macro_rules! capabilities {
    ($($variant:ident = $num:literal => $name:literal),+ $(,)?) => {
        /// Linux capability identifiers.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        #[repr(u8)]
        #[allow(missing_docs)]
        pub enum Capability {
            $($variant = $num),+
        }

        impl Capability {
            /// Every capability known to this build.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// Kernel capability number.
            #[must_use]
            pub const fn number(self) -> u8 {
                self as u8
            }

            /// Canonical `CAP_*` name.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name),+
                }
            }
        }
    };
}

capabilities! {
    Chown = 0 => "CAP_CHOWN",
    DacOverride = 1 => "CAP_DAC_OVERRIDE",
    DacReadSearch = 2 => "CAP_DAC_READ_SEARCH",
    Fowner = 3 => "CAP_FOWNER",
    Fsetid = 4 => "CAP_FSETID",
    Kill = 5 => "CAP_KILL",
    Setgid = 6 => "CAP_SETGID",
    Setuid = 7 => "CAP_SETUID",
    Setpcap = 8 => "CAP_SETPCAP",
    LinuxImmutable = 9 => "CAP_LINUX_IMMUTABLE",
    NetBindService = 10 => "CAP_NET_BIND_SERVICE",
    NetBroadcast = 11 => "CAP_NET_BROADCAST",
    NetAdmin = 12 => "CAP_NET_ADMIN",
    NetRaw = 13 => "CAP_NET_RAW",
    IpcLock = 14 => "CAP_IPC_LOCK",
    IpcOwner = 15 => "CAP_IPC_OWNER",
    SysModule = 16 => "CAP_SYS_MODULE",
    SysRawio = 17 => "CAP_SYS_RAWIO",
    SysChroot = 18 => "CAP_SYS_CHROOT",
    SysPtrace = 19 => "CAP_SYS_PTRACE",
    SysPacct = 20 => "CAP_SYS_PACCT",
    SysAdmin = 21 => "CAP_SYS_ADMIN",
    SysBoot = 22 => "CAP_SYS_BOOT",
    SysNice = 23 => "CAP_SYS_NICE",
    SysResource = 24 => "CAP_SYS_RESOURCE",
    SysTime = 25 => "CAP_SYS_TIME",
    SysTtyConfig = 26 => "CAP_SYS_TTY_CONFIG",
    Mknod = 27 => "CAP_MKNOD",
    Lease = 28 => "CAP_LEASE",
    AuditWrite = 29 => "CAP_AUDIT_WRITE",
    AuditControl = 30 => "CAP_AUDIT_CONTROL",
    Setfcap = 31 => "CAP_SETFCAP",
    MacOverride = 32 => "CAP_MAC_OVERRIDE",
    MacAdmin = 33 => "CAP_MAC_ADMIN",
    Syslog = 34 => "CAP_SYSLOG",
    WakeAlarm = 35 => "CAP_WAKE_ALARM",
    BlockSuspend = 36 => "CAP_BLOCK_SUSPEND",
    AuditRead = 37 => "CAP_AUDIT_READ",
    Perfmon = 38 => "CAP_PERFMON",
    Bpf = 39 => "CAP_BPF",
    CheckpointRestore = 40 => "CAP_CHECKPOINT_RESTORE",
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Capability {
    type Err = BerthError;

    /// Accepts `CAP_NET_ADMIN`, `NET_ADMIN`, or `net_admin`.
    fn from_str(s: &str) -> Result<Self> {
        let upper = s.to_ascii_uppercase();
        let wanted = if upper.starts_with("CAP_") {
            upper
        } else {
            format!("CAP_{upper}")
        };
        Self::ALL
            .iter()
            .copied()
            .find(|cap| cap.name() == wanted)
            .ok_or_else(|| BerthError::config(format!("unknown capability {s:?}")))
    }
}

impl TryFrom<String> for Capability {
    type Error = BerthError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Capability> for String {
    fn from(cap: Capability) -> Self {
        cap.name().to_string()
    }
}

/// Highest capability number supported by the running kernel.
#[must_use]
pub fn last_cap() -> u8 {
    std::fs::read_to_string("/proc/sys/kernel/cap_last_cap")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(Capability::CheckpointRestore.number())
}

/// Removes every capability not in `keep` from the bounding set.
///
/// Requires `CAP_SETPCAP`, so this must run before privileges are dropped.
///
/// # Errors
///
/// Returns an error if a `PR_CAPBSET_DROP` call fails.
pub fn drop_bounding_set(keep: &[Capability]) -> Result<()> {
    for number in 0..=last_cap() {
        if keep.iter().any(|cap| cap.number() == number) {
            continue;
        }
        // SAFETY: PR_CAPBSET_DROP takes a plain integer argument.
        let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, libc::c_ulong::from(number), 0, 0, 0) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            // Numbers beyond what the kernel knows are reported as EINVAL.
            if err.raw_os_error() == Some(libc::EINVAL) {
                continue;
            }
            return Err(BerthError::PermissionDenied {
                message: format!("dropping capability {number} from bounding set: {err}"),
            });
        }
    }
    tracing::debug!(retained = keep.len(), "bounding set reduced");
    Ok(())
}

/// Sets or clears `PR_SET_KEEPCAPS` so permitted capabilities survive a
/// switch away from uid 0.
///
/// # Errors
///
/// Returns an error if the `prctl(2)` call fails.
pub fn set_keep_caps(keep: bool) -> Result<()> {
    // SAFETY: PR_SET_KEEPCAPS takes a 0/1 integer argument.
    let rc = unsafe { libc::prctl(libc::PR_SET_KEEPCAPS, libc::c_ulong::from(keep), 0, 0, 0) };
    if rc != 0 {
        return Err(BerthError::PermissionDenied {
            message: format!("PR_SET_KEEPCAPS: {}", std::io::Error::last_os_error()),
        });
    }
    Ok(())
}

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: libc::c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

/// Replaces the effective, permitted, and inheritable sets of the calling
/// thread with `keep`, and clears the ambient set.
///
/// # Errors
///
/// Returns an error if `capset(2)` fails.
pub fn set_capabilities(keep: &[Capability]) -> Result<()> {
    let mut data = [CapUserData::default(); 2];
    for cap in keep {
        let number = usize::from(cap.number());
        let bit = 1u32 << (number % 32);
        let slot = &mut data[number / 32];
        slot.effective |= bit;
        slot.permitted |= bit;
        slot.inheritable |= bit;
    }
    let mut header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    // SAFETY: header and data match the kernel's v3 capability ABI and
    // outlive the call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_capset,
            std::ptr::addr_of_mut!(header),
            data.as_ptr(),
        )
    };
    if rc != 0 {
        return Err(BerthError::PermissionDenied {
            message: format!("capset: {}", std::io::Error::last_os_error()),
        });
    }
    // SAFETY: PR_CAP_AMBIENT_CLEAR_ALL takes no pointer arguments.
    let _ = unsafe {
        libc::prctl(
            libc::PR_CAP_AMBIENT,
            libc::PR_CAP_AMBIENT_CLEAR_ALL as libc::c_ulong,
            0,
            0,
            0,
        )
    };
    tracing::debug!(retained = keep.len(), "capability sets replaced");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_match_kernel_abi() {
        assert_eq!(Capability::Chown.number(), 0);
        assert_eq!(Capability::SysAdmin.number(), 21);
        assert_eq!(Capability::CheckpointRestore.number(), 40);
    }

    #[test]
    fn parses_with_or_without_prefix() {
        assert_eq!("CAP_NET_ADMIN".parse::<Capability>().expect("cap"), Capability::NetAdmin);
        assert_eq!("net_admin".parse::<Capability>().expect("cap"), Capability::NetAdmin);
        assert!("CAP_FLY".parse::<Capability>().is_err());
    }

    #[test]
    fn serializes_as_canonical_name() {
        let json = serde_json::to_string(&Capability::Kill).expect("json");
        assert_eq!(json, "\"CAP_KILL\"");
        let back: Capability = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, Capability::Kill);
    }

    #[test]
    fn every_variant_has_a_distinct_name() {
        let mut names: Vec<_> = Capability::ALL.iter().map(|c| c.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Capability::ALL.len());
    }
}
