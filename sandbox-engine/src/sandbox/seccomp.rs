/// Syscall filter for sandboxed samples
///
/// Renders a docker-compatible seccomp profile: everything not explicitly
/// allowed fails with an errno, and the dangerous classes (module loading,
/// mount operations, namespace manipulation, kexec) are listed again as an
/// explicit block so the intent survives profile merges.

use serde::Serialize;
use serde_json::{json, Value};

/// Syscalls needed by ordinary programs and by the tracing helpers
const ALLOWED_SYSCALLS: &[&str] = &[
    // process lifecycle
    "execve", "execveat", "fork", "vfork", "clone", "clone3", "exit", "exit_group", "wait4",
    "waitid", "kill", "tgkill", "tkill", "getpid", "getppid", "gettid", "getpgid", "setpgid",
    "getpgrp", "setsid", "getsid", "prctl", "arch_prctl", "set_tid_address", "set_robust_list",
    "get_robust_list", "rseq", "sched_yield", "sched_getaffinity", "sched_setaffinity",
    "getpriority", "setpriority", "prlimit64", "getrlimit", "setrlimit", "getrusage",
    // tracing
    "ptrace", "process_vm_readv",
    // identity
    "getuid", "geteuid", "getgid", "getegid", "getgroups", "getresuid", "getresgid",
    "setuid", "setgid", "setreuid", "setregid", "setresuid", "setresgid", "capget",
    // files
    "read", "write", "pread64", "pwrite64", "readv", "writev", "open", "openat", "openat2",
    "close", "close_range", "creat", "stat", "fstat", "lstat", "newfstatat", "statx", "statfs",
    "fstatfs", "access", "faccessat", "faccessat2", "lseek", "getdents", "getdents64",
    "getcwd", "chdir", "fchdir", "rename", "renameat", "renameat2", "mkdir", "mkdirat",
    "rmdir", "unlink", "unlinkat", "link", "linkat", "symlink", "symlinkat", "readlink",
    "readlinkat", "chmod", "fchmod", "fchmodat", "chown", "fchown", "fchownat", "lchown",
    "truncate", "ftruncate", "fallocate", "fsync", "fdatasync", "umask", "utimensat",
    "dup", "dup2", "dup3", "pipe", "pipe2", "fcntl", "flock", "ioctl", "sendfile",
    "copy_file_range", "splice", "tee", "inotify_init1", "inotify_add_watch", "inotify_rm_watch",
    "getxattr", "lgetxattr", "fgetxattr", "listxattr",
    // memory
    "brk", "mmap", "munmap", "mremap", "mprotect", "madvise", "mlock", "munlock", "msync",
    "mincore", "membarrier",
    // SysV shared memory, used by the X server's MIT-SHM extension
    "shmget", "shmat", "shmdt", "shmctl",
    // signals and time
    "rt_sigaction", "rt_sigprocmask", "rt_sigreturn", "rt_sigsuspend", "rt_sigtimedwait",
    "sigaltstack", "pause", "alarm", "nanosleep", "clock_nanosleep", "clock_gettime",
    "clock_getres", "gettimeofday", "time", "times", "setitimer", "getitimer",
    "timer_create", "timer_settime", "timer_delete", "timerfd_create", "timerfd_settime",
    // polling and events
    "poll", "ppoll", "select", "pselect6", "epoll_create", "epoll_create1", "epoll_ctl",
    "epoll_wait", "epoll_pwait", "eventfd", "eventfd2", "futex", "signalfd4",
    // network
    "socket", "socketpair", "connect", "accept", "accept4", "bind", "listen", "sendto",
    "recvfrom", "sendmsg", "recvmsg", "sendmmsg", "recvmmsg", "shutdown", "getsockname",
    "getpeername", "getsockopt", "setsockopt",
    // misc
    "uname", "sysinfo", "getrandom", "memfd_create", "personality",
];

/// Dangerous syscall classes that stay blocked regardless of the allow list
const BLOCKED_SYSCALLS: &[&str] = &[
    "mount", "umount", "umount2", "init_module", "finit_module", "delete_module", "kexec_load",
    "kexec_file_load", "reboot", "swapon", "swapoff", "bpf", "setns", "unshare", "pivot_root",
    "acct", "iopl", "ioperm", "open_by_handle_at", "userfaultfd", "perf_event_open",
];

/// EPERM, returned for every filtered syscall
const ERRNO_EPERM: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyscallFilter {
    pub allowed: Vec<String>,
    pub blocked: Vec<String>,
}

impl SyscallFilter {
    /// The filter applied to every sandbox run
    pub fn hardened() -> Self {
        Self {
            allowed: ALLOWED_SYSCALLS.iter().map(|s| s.to_string()).collect(),
            blocked: BLOCKED_SYSCALLS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn allows(&self, syscall: &str) -> bool {
        !self.blocks(syscall) && self.allowed.iter().any(|s| s == syscall)
    }

    pub fn blocks(&self, syscall: &str) -> bool {
        self.blocked.iter().any(|s| s == syscall)
    }

    /// Render as a seccomp profile accepted by `--security-opt seccomp=<file>`
    pub fn to_profile(&self) -> Value {
        json!({
            "defaultAction": "SCMP_ACT_ERRNO",
            "defaultErrnoRet": ERRNO_EPERM,
            "architectures": ["SCMP_ARCH_X86_64", "SCMP_ARCH_X86", "SCMP_ARCH_AARCH64"],
            "syscalls": [
                {
                    "names": self.allowed,
                    "action": "SCMP_ACT_ALLOW",
                },
                {
                    "names": self.blocked,
                    "action": "SCMP_ACT_ERRNO",
                    "errnoRet": ERRNO_EPERM,
                },
            ],
        })
    }
}
