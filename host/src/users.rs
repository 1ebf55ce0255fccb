//! Local user database lookup.

use std::io;
use std::path::{Path, PathBuf};

/// The fields of a passwd entry the credential broker needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

impl UserEntry {
    /// Parse one `name:passwd:uid:gid:gecos:home:shell` line.
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split(':');
        let name = fields.next().filter(|n| !n.is_empty())?;
        let _passwd = fields.next()?;
        let uid = fields.next()?.parse().ok()?;
        let gid = fields.next()?.parse().ok()?;
        let _gecos = fields.next()?;
        let home = fields.next()?;
        Some(Self {
            name: name.to_string(),
            uid,
            gid,
            home: PathBuf::from(home),
        })
    }
}

/// Find the first entry with `uid` by a single pass over the database.
pub async fn lookup_uid(passwd: &Path, uid: u64) -> io::Result<Option<UserEntry>> {
    let contents = tokio::fs::read_to_string(passwd).await?;
    Ok(contents
        .lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(UserEntry::parse)
        .find(|entry| u64::from(entry.uid) == uid))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWD: &str = "root:x:0:0:root:/root:/bin/bash\n\
                          # comment\n\
                          broken line\n\
                          alice:x:1000:1000:Alice,,,:/home/alice:/bin/zsh\n\
                          alias:x:1000:1000::/home/alias:/bin/sh\n";

    #[test]
    fn parses_entry() {
        let entry = UserEntry::parse("bob:x:1001:100:Bob:/home/bob:/bin/sh").unwrap();
        assert_eq!(entry.name, "bob");
        assert_eq!(entry.uid, 1001);
        assert_eq!(entry.gid, 100);
        assert_eq!(entry.home, PathBuf::from("/home/bob"));
        assert!(UserEntry::parse("bob:x:notanumber:100::/home/bob:/bin/sh").is_none());
        assert!(UserEntry::parse(":x:1:1::/:/bin/sh").is_none());
    }

    #[tokio::test]
    async fn first_match_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passwd");
        std::fs::write(&path, PASSWD).unwrap();

        let alice = lookup_uid(&path, 1000).await.unwrap().unwrap();
        assert_eq!(alice.name, "alice");
        assert!(lookup_uid(&path, 4242).await.unwrap().is_none());
        assert!(lookup_uid(&path, u64::from(u32::MAX) + 1).await.unwrap().is_none());
    }
}
