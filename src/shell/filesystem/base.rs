//! Process-wide immutable base image of the simulated Ubuntu host.
//!
//! Built once on first access and never mutated afterwards, so no lock is
//! needed; sessions layer their private overlays on top of it. A
//! parent-to-children index is precomputed so directory listings never scan
//! the whole map, and uid/gid reverse indexes back the `ls -l` name lookup.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Local};

use super::{parent_of, FileEntry};

/// Every simulated command gets an ELF-stub placeholder in /bin and
/// /usr/bin. The list intentionally includes names the shell does not
/// implement; running those still yields "command not found", which is how
/// half-installed servers feel anyway.
const COMMANDS: &[&str] = &[
    "ls", "cd", "pwd", "cat", "echo", "touch", "mkdir", "rm", "mv", "cp", "grep", "ps", "top",
    "kill", "id", "whoami", "w", "last", "history", "date", "uptime", "free", "df", "uname",
    "stty", "env", "clear", "exit", "vi", "vim", "wget", "curl", "ssh", "chmod", "chown", "which",
    "find", "head", "tail", "wc", "export", "mount", "stat", "who", "sudo", "ping", "netstat",
    "ss", "sleep", "ln", "rmdir", "more", "less", "kernelpanic",
];

const ELF_STUB: &[u8] = b"\x7fELF\x02\x01\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x02\x00\x3e\x00\x01\x00\x00\x00";

pub struct BaseImage {
    entries: HashMap<String, Arc<FileEntry>>,
    children: HashMap<String, Vec<Arc<FileEntry>>>,
    users: HashMap<String, u32>,
    groups: HashMap<String, u32>,
    user_names: HashMap<u32, String>,
    group_names: HashMap<u32, String>,
    /// Pretend boot instant, interpolated into ps/uptime output.
    pub booted: DateTime<Local>,
}

static BASE: OnceLock<BaseImage> = OnceLock::new();

/// The shared base image, built on first use.
pub fn base() -> &'static BaseImage {
    BASE.get_or_init(BaseImage::build)
}

impl BaseImage {
    pub fn entry(&self, path: &str) -> Option<&Arc<FileEntry>> {
        self.entries.get(path)
    }

    pub fn children_of(&self, dir: &str) -> &[Arc<FileEntry>] {
        self.children.get(dir).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn uid_of(&self, user: &str) -> Option<u32> {
        self.users.get(user).copied()
    }

    pub fn gid_of(&self, group: &str) -> Option<u32> {
        self.groups.get(group).copied()
    }

    pub fn user_name(&self, uid: u32) -> Option<&str> {
        self.user_names.get(&uid).map(String::as_str)
    }

    pub fn group_name(&self, gid: u32) -> Option<&str> {
        self.group_names.get(&gid).map(String::as_str)
    }

    fn build() -> Self {
        let mut entries: HashMap<String, Arc<FileEntry>> = HashMap::new();

        let dirs = [
            "/", "/bin", "/boot", "/dev", "/etc", "/home", "/lib", "/lib64", "/media", "/mnt",
            "/opt", "/proc", "/root", "/run", "/sbin", "/srv", "/sys", "/tmp", "/usr", "/var",
            "/usr/bin", "/usr/sbin", "/usr/local", "/usr/local/bin", "/var/log", "/home/user",
            "/etc/ssh", "/etc/systemd", "/etc/network", "/proc/sys", "/proc/sys/kernel",
            "/proc/net", "/sys/class", "/sys/class/net", "/sys/class/net/eth0", "/var/www",
            "/var/www/html",
        ];
        for d in dirs {
            let name = if d == "/" { "/" } else { super::basename(d) };
            entries.insert(d.to_string(), Arc::new(FileEntry::dir(name, 0o755, 0, 0)));
        }

        let mut add = |path: &str, content: &str, mode: u32, uid: u32, gid: u32| {
            entries.insert(
                path.to_string(),
                Arc::new(FileEntry::file(
                    super::basename(path),
                    content.as_bytes().to_vec(),
                    mode,
                    uid,
                    gid,
                )),
            );
        };

        let passwd = "root:x:0:0:root:/root:/bin/bash\n\
            daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin\n\
            bin:x:2:2:bin:/bin:/usr/sbin/nologin\n\
            sys:x:3:3:sys:/dev:/usr/sbin/nologin\n\
            sync:x:4:65534:sync:/bin:/bin/sync\n\
            games:x:5:60:games:/usr/games:/usr/sbin/nologin\n\
            man:x:6:12:man:/var/cache/man:/usr/sbin/nologin\n\
            lp:x:7:7:lp:/var/spool/lpd:/usr/sbin/nologin\n\
            mail:x:8:8:mail:/var/mail:/usr/sbin/nologin\n\
            news:x:9:9:news:/var/spool/news:/usr/sbin/nologin\n\
            www-data:x:33:33:www-data:/var/www:/usr/sbin/nologin\n\
            sshd:x:108:65534::/run/sshd:/usr/sbin/nologin\n\
            user:x:1000:1000:user:/home/user:/bin/bash\n";
        let group = "root:x:0:\n\
            daemon:x:1:\n\
            bin:x:2:\n\
            sys:x:3:\n\
            adm:x:4:syslog\n\
            tty:x:5:\n\
            disk:x:6:\n\
            lp:x:7:\n\
            mail:x:8:\n\
            news:x:9:\n\
            www-data:x:33:\n\
            sshd:x:108:\n\
            user:x:1000:\n";

        add("/etc/passwd", passwd, 0o644, 0, 0);
        add("/etc/group", group, 0o644, 0, 0);
        add("/etc/hostname", "ubuntu-server", 0o644, 0, 0);
        add(
            "/etc/os-release",
            "PRETTY_NAME=\"Ubuntu 22.04.1 LTS\"\nNAME=\"Ubuntu\"\nVERSION_ID=\"22.04\"\nVERSION=\"22.04.1 LTS (Jammy Jellyfish)\"\nID=ubuntu\n",
            0o644, 0, 0,
        );
        add("/etc/issue", "Ubuntu 22.04.1 LTS \\n \\l\n", 0o644, 0, 0);
        add(
            "/etc/shadow",
            "root:*:18890:0:99999:7:::\nuser:$6$...:18890:0:99999:7:::\n",
            0o640, 0, 42,
        );
        add(
            "/root/.bashrc",
            "export PS1='\\[\\033[01;32m\\]\\u@\\h\\[\\033[00m\\]:\\[\\033[01;34m\\]\\w\\[\\033[00m\\]\\$ '\nalias ll='ls -alF'\n",
            0o644, 0, 0,
        );
        add(
            "/etc/hosts",
            "127.0.0.1 localhost\n127.0.1.1 ubuntu-server\n",
            0o644, 0, 0,
        );
        add(
            "/etc/resolv.conf",
            "nameserver 1.1.1.1\nnameserver 8.8.8.8\n",
            0o644, 0, 0,
        );
        add("/etc/fstab", "/dev/sda2 / ext4 defaults 0 0\n", 0o644, 0, 0);

        add(
            "/proc/version",
            "Linux version 5.15.0-generic (buildd@lcy02-amd64-001) (gcc version 11.2.0 (Ubuntu 11.2.0-19ubuntu1))",
            0o444, 0, 0,
        );
        add(
            "/proc/cpuinfo",
            "processor\t: 0\nvendor_id\t: GenuineIntel\ncpu family\t: 6\nmodel\t\t: 165\nmodel name\t: Intel(R) Core(TM) i7-10700 CPU @ 2.90GHz\n\nprocessor\t: 1\nvendor_id\t: GenuineIntel\ncpu family\t: 6\nmodel\t\t: 165\nmodel name\t: Intel(R) Core(TM) i7-10700 CPU @ 2.90GHz\n",
            0o444, 0, 0,
        );
        add(
            "/proc/meminfo",
            "MemTotal:       16303284 kB\nMemFree:         2543210 kB\nMemAvailable:   10234123 kB\nBuffers:          223412 kB\nCached:          8123456 kB\nSwapTotal:       2097148 kB\nSwapFree:        2097148 kB\n",
            0o444, 0, 0,
        );
        add("/proc/uptime", "3600.00 7100.00", 0o444, 0, 0);
        add("/proc/loadavg", "0.01 0.05 0.05 1/256 12345", 0o444, 0, 0);
        add("/sys/class/net/eth0/address", "00:11:22:33:44:55\n", 0o444, 0, 0);

        add("/dev/null", "", 0o666, 0, 0);
        add("/dev/zero", "", 0o666, 0, 0);
        add("/dev/random", "gibberish...", 0o666, 0, 0);
        add("/dev/urandom", "more gibberish...", 0o666, 0, 0);

        for c in COMMANDS {
            for prefix in ["/bin/", "/usr/bin/"] {
                entries.insert(
                    format!("{prefix}{c}"),
                    Arc::new(FileEntry::file(*c, ELF_STUB.to_vec(), 0o755, 0, 0)),
                );
            }
        }

        // Parent index, filled after the map is complete.
        let mut children: HashMap<String, Vec<Arc<FileEntry>>> = HashMap::new();
        for (path, entry) in &entries {
            let dir = parent_of(path);
            if dir != path {
                children.entry(dir.to_string()).or_default().push(entry.clone());
            }
        }

        let (users, groups) = parse_users_groups(passwd, group);
        let user_names = users.iter().map(|(n, id)| (*id, n.clone())).collect();
        let group_names = groups.iter().map(|(n, id)| (*id, n.clone())).collect();

        BaseImage {
            entries,
            children,
            users,
            groups,
            user_names,
            group_names,
            booted: Local::now(),
        }
    }
}

fn parse_users_groups(
    passwd: &str,
    group: &str,
) -> (HashMap<String, u32>, HashMap<String, u32>) {
    let parse = |db: &str| {
        db.lines()
            .filter_map(|line| {
                let mut parts = line.split(':');
                let name = parts.next()?;
                let id = parts.nth(1)?.parse().ok()?;
                Some((name.to_string(), id))
            })
            .collect()
    };
    (parse(passwd), parse(group))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_present() {
        let b = base();
        for p in [
            "/etc/passwd", "/etc/group", "/etc/shadow", "/etc/hostname", "/etc/os-release",
            "/etc/issue", "/etc/hosts", "/etc/resolv.conf", "/etc/fstab", "/etc/ssh",
            "/proc/version", "/proc/cpuinfo", "/proc/meminfo", "/proc/uptime", "/proc/loadavg",
            "/sys/class/net/eth0/address", "/dev/null", "/dev/zero", "/dev/random",
            "/dev/urandom", "/root/.bashrc", "/bin/ls", "/usr/bin/ls", "/bin/kernelpanic",
        ] {
            assert!(b.entry(p).is_some(), "missing {p}");
        }
        assert!(b.entry("/root").is_some_and(|e| e.is_dir));
    }

    #[test]
    fn test_dir_index_matches_map() {
        let b = base();
        let etc = b.children_of("/etc");
        assert!(etc.iter().any(|e| e.name == "passwd"));
        assert!(etc.iter().any(|e| e.name == "ssh"));
        // The directory itself is not its own child.
        assert!(b.children_of("/").iter().all(|e| e.name != "/"));
    }

    #[test]
    fn test_command_stubs_are_executable_elves() {
        let b = base();
        let ls = b.entry("/bin/ls").unwrap();
        let st = ls.read();
        assert!(st.content.starts_with(b"\x7fELF"));
        assert_eq!(st.mode & 0o111, 0o111);
    }

    #[test]
    fn test_user_group_reverse_index() {
        let b = base();
        assert_eq!(b.uid_of("root"), Some(0));
        assert_eq!(b.uid_of("user"), Some(1000));
        assert_eq!(b.gid_of("www-data"), Some(33));
        assert_eq!(b.user_name(0), Some("root"));
        assert_eq!(b.group_name(1000), Some("user"));
        assert_eq!(b.user_name(4242), None);
    }
}
