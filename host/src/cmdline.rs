//! Kernel command line composition.

use std::net::Ipv4Addr;

use crate::config::{CardConfig, RootKind};

const DEFAULT_PREFIX: u8 = 24;

/// Build the card kernel command line from its configuration.
pub fn compose(card: &CardConfig) -> Result<String, String> {
    let mut parts: Vec<String> = Vec::new();

    if !card.boot.verbose {
        parts.push("quiet".into());
    }
    parts.push(root_argument(card)?);
    if let Some(console) = &card.boot.console {
        parts.push(format!("console={console}"));
    }
    if !card.boot.cgroup_memory {
        parts.push("cgroup_disable=memory".into());
    }
    if let Some(extra) = card.boot.extra_cmdline.as_deref().filter(|s| !s.is_empty()) {
        parts.push(extra.to_string());
    }
    if let Some(pm) = &card.boot.power_management {
        parts.push(format!("micpm={pm}"));
    }
    Ok(parts.join(" "))
}

fn root_argument(card: &CardConfig) -> Result<String, String> {
    match card.root.kind {
        RootKind::Ramfs | RootKind::StaticRamfs => Ok("root=ramfs".into()),
        RootKind::Pfs => Ok("root=/dev/vda".into()),
        RootKind::Nfs | RootKind::SplitNfs => {
            let target = card
                .root
                .target
                .as_ref()
                .ok_or("RootDevice parameter invalid: NFS target not set")?;
            let ip = card
                .network
                .ip
                .as_deref()
                .ok_or("RootDevice parameter invalid: card IP not set")?;
            let prefix = card.network.prefix.unwrap_or(DEFAULT_PREFIX);
            let mut arg = format!(
                "root=nfs:{} ip={} netmask={}",
                target.display(),
                ip,
                netmask(prefix)?
            );
            if let Some(mtu) = card.network.mtu {
                arg.push_str(&format!(" mtu={mtu}"));
            }
            if let Some(mac) = &card.network.mac {
                arg.push_str(&format!(" hwaddr={mac}"));
            }
            Ok(arg)
        }
    }
}

fn netmask(prefix: u8) -> Result<Ipv4Addr, String> {
    if prefix > 32 {
        return Err(format!("invalid network prefix {prefix}"));
    }
    let bits = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
    Ok(Ipv4Addr::from(bits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn ramfs_defaults() {
        let card = CardConfig::new("mic0");
        assert_eq!(compose(&card).unwrap(), "quiet root=ramfs cgroup_disable=memory");
    }

    #[test]
    fn all_options_in_order() {
        let mut card = CardConfig::new("mic0");
        card.boot.verbose = true;
        card.boot.console = Some("hvc0".into());
        card.boot.cgroup_memory = true;
        card.boot.extra_cmdline = Some("highres=off".into());
        card.boot.power_management = Some("cpufreq_on;corec6_off".into());
        card.root.kind = RootKind::Pfs;
        assert_eq!(
            compose(&card).unwrap(),
            "root=/dev/vda console=hvc0 highres=off micpm=cpufreq_on;corec6_off"
        );
    }

    #[test]
    fn nfs_root_carries_network_settings() {
        let mut card = CardConfig::new("mic1");
        card.root.kind = RootKind::Nfs;
        card.root.target = Some(PathBuf::from("host:/export/mic1"));
        card.network.ip = Some("172.31.2.1".into());
        card.network.prefix = Some(16);
        card.network.mtu = Some(64512);
        card.network.mac = Some("4c:79:ba:00:00:01".into());
        assert_eq!(
            compose(&card).unwrap(),
            "quiet root=nfs:host:/export/mic1 ip=172.31.2.1 netmask=255.255.0.0 \
             mtu=64512 hwaddr=4c:79:ba:00:00:01 cgroup_disable=memory"
        );
    }

    #[test]
    fn nfs_without_ip_is_an_error() {
        let mut card = CardConfig::new("mic1");
        card.root.kind = RootKind::SplitNfs;
        card.root.target = Some(PathBuf::from("host:/export"));
        assert!(compose(&card).is_err());
    }

    #[test]
    fn netmask_edges() {
        assert_eq!(netmask(0).unwrap(), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(netmask(24).unwrap(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(netmask(32).unwrap(), Ipv4Addr::new(255, 255, 255, 255));
        assert!(netmask(33).is_err());
    }
}
