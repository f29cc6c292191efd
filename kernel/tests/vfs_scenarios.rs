//! End-to-end VFS scenarios against a scripted filesystem server.

use std::collections::BTreeMap;

use malvern_kernel::boot_info::BootInfo;
use malvern_kernel::error::KernelError;
use malvern_kernel::fs::{FileMode, NoteFlags, OpenFlags};
use malvern_kernel::hal::NullHal;
use malvern_kernel::ipc::{IoOp, IoReply, NodeAttr};
use malvern_kernel::kernel::Kernel;
use malvern_kernel::proc::thread::{SchedPolicy, ThreadId, ThreadState};

static TEST_HAL: NullHal = NullHal::new();

const ROOT_INO: u64 = 2;

/// A scripted in-memory filesystem server: directories as name maps,
/// file data as offset-keyed clusters, plus counters the tests assert
/// on.
#[derive(Default)]
struct MockFs {
    dirs: BTreeMap<u64, BTreeMap<String, NodeAttr>>,
    data: BTreeMap<(u64, u64), Vec<u8>>,
    links: BTreeMap<u64, String>,
    next_ino: u64,
    lookups: usize,
    strategies: usize,
}

impl MockFs {
    fn new() -> Self {
        let mut fs = Self {
            next_ino: 100,
            ..Self::default()
        };
        fs.dirs.insert(ROOT_INO, BTreeMap::new());
        fs
    }

    fn add_file(&mut self, dir: u64, name: &str, mode: u32, size: u64) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.dirs.entry(dir).or_default().insert(
            name.into(),
            NodeAttr {
                ino,
                mode,
                size,
                uid: 0,
                gid: 0,
            },
        );
        ino
    }

    fn handle(&mut self, op: IoOp) -> IoReply {
        match op {
            IoOp::Lookup { dir_ino, name } => {
                self.lookups += 1;
                match self.dirs.get(&dir_ino).and_then(|d| d.get(&name)) {
                    Some(attr) => IoReply {
                        status: 0,
                        data: Vec::new(),
                        attr: Some(*attr),
                    },
                    None => IoReply::error(-2),
                }
            }
            IoOp::Read { ino, offset, len } => {
                let cluster = offset / 4096 * 4096;
                let data = self
                    .data
                    .get(&(ino, cluster))
                    .cloned()
                    .unwrap_or_else(|| vec![0; len.min(4096)]);
                IoReply {
                    status: data.len() as i64,
                    data,
                    attr: None,
                }
            }
            IoOp::Write { ino, offset, data } | IoOp::Strategy { ino, offset, data } => {
                self.strategies += 1;
                let n = data.len() as i64;
                self.data.insert((ino, offset), data);
                IoReply {
                    status: n,
                    data: Vec::new(),
                    attr: None,
                }
            }
            IoOp::Mknod { dir_ino, name, mode } => {
                if self
                    .dirs
                    .get(&dir_ino)
                    .map(|d| d.contains_key(&name))
                    .unwrap_or(false)
                {
                    return IoReply::error(-17);
                }
                self.add_file(dir_ino, &name, mode, 0);
                IoReply {
                    status: 0,
                    data: Vec::new(),
                    attr: self.dirs[&dir_ino].get(&name).copied(),
                }
            }
            IoOp::Unlink { dir_ino, name } => {
                match self.dirs.get_mut(&dir_ino).and_then(|d| d.remove(&name)) {
                    Some(_) => IoReply::ok(),
                    None => IoReply::error(-2),
                }
            }
            IoOp::Truncate { .. } => IoReply::ok(),
            IoOp::Readlink { ino } => match self.links.get(&ino) {
                Some(target) => IoReply {
                    status: target.len() as i64,
                    data: target.as_bytes().to_vec(),
                    attr: None,
                },
                None => IoReply::error(-2),
            },
            IoOp::Symlink {
                dir_ino,
                name,
                target,
            } => {
                let ino = self.add_file(dir_ino, &name, FileMode::IFLNK | 0o777, 0);
                self.links.insert(ino, target);
                IoReply::ok()
            }
        }
    }
}

struct World {
    k: Kernel,
    fs: MockFs,
    server: ThreadId,
    server_fd: i32,
    client: ThreadId,
}

fn setup() -> World {
    let mut k = Kernel::new(&BootInfo::hosted(16 * 1024 * 1024), &TEST_HAL).unwrap();
    let server_pid = k.proc_create("rootfs", None).unwrap();
    let server = k.thread_create(server_pid, SchedPolicy::Rr, 24).unwrap();
    let client_pid = k.proc_create("client", None).unwrap();
    let client = k.thread_create(client_pid, SchedPolicy::Other, 10).unwrap();

    k.sched.adopt(&mut k.threads, server).unwrap();
    let server_fd = k
        .mount_root(ROOT_INO, FileMode::IFDIR | 0o755)
        .unwrap();

    World {
        k,
        fs: MockFs::new(),
        server,
        server_fd,
        client,
    }
}

/// Drain the server's queue: receive until it would park, replying
/// from the scripted filesystem.
fn pump_server(w: &mut World) {
    loop {
        // A sleeping server has drained its queue; the next send wakes
        // it through the port's receiver rendez.
        if w.k.threads.get(w.server).unwrap().state == ThreadState::Sleeping {
            break;
        }
        w.k.sched.adopt(&mut w.k.threads, w.server).unwrap();
        match w.k.sys_msg_receive(w.server_fd) {
            Ok((req, op)) => {
                let reply = w.fs.handle(op);
                w.k.sys_msg_reply(req, reply).unwrap();
            }
            Err(KernelError::WouldBlock) => break,
            Err(e) => panic!("server receive failed: {:?}", e),
        }
    }
}

/// Run a client operation to completion, pumping the server and the
/// service threads whenever the client parks.
fn run_client<R: core::fmt::Debug>(
    w: &mut World,
    mut op: impl FnMut(&mut Kernel) -> Result<R, KernelError>,
) -> Result<R, KernelError> {
    for _ in 0..64 {
        w.k.sched.adopt(&mut w.k.threads, w.client).unwrap();
        match op(&mut w.k) {
            Err(KernelError::WouldBlock) => {
                pump_server(w);
                w.k.service_kthreads().unwrap();
            }
            other => return other,
        }
    }
    panic!("client operation did not settle");
}

#[test]
fn lookup_populates_dname_cache() {
    let mut w = setup();
    w.fs.add_file(ROOT_INO, "motd", FileMode::IFREG | 0o644, 0);

    let fd = run_client(&mut w, |k| k.open_path("/motd", OpenFlags::READ)).unwrap();
    assert!(fd >= 0);
    let first = w.fs.lookups;
    assert!(first >= 1);

    // A second walk of the same component comes from the cache.
    let fd2 = run_client(&mut w, |k| k.open_path("/motd", OpenFlags::READ)).unwrap();
    assert_eq!(w.fs.lookups, first);
    assert_ne!(fd, fd2);

    run_client(&mut w, |k| k.sys_close(fd)).unwrap();
    run_client(&mut w, |k| k.sys_close(fd2)).unwrap();
    assert!(w.k.check_vnode_invariant());
}

#[test]
fn write_then_read_roundtrip_through_cache() {
    let mut w = setup();
    w.fs.add_file(ROOT_INO, "log", FileMode::IFREG | 0o644, 0);

    let fd = run_client(&mut w, |k| {
        k.open_path("/log", OpenFlags::READ | OpenFlags::WRITE)
    })
    .unwrap();
    let n = run_client(&mut w, |k| k.write_fd(fd, b"hello, cache")).unwrap();
    assert_eq!(n, 12);

    // The write went to the cache, not the server.
    assert_eq!(w.fs.strategies, 0);

    // Reopen and read it back through the same buffers.
    let fd2 = run_client(&mut w, |k| k.open_path("/log", OpenFlags::READ)).unwrap();
    let data = run_client(&mut w, |k| k.read_fd(fd2, 64)).unwrap();
    assert_eq!(&data, b"hello, cache");

    // Explicit flush pushes the dirty cluster to the server.
    run_client(&mut w, |k| k.sys_fsync(fd)).unwrap();
    assert!(w.fs.strategies >= 1);

    run_client(&mut w, |k| k.sys_close(fd)).unwrap();
    run_client(&mut w, |k| k.sys_close(fd2)).unwrap();
}

#[test]
fn write_fires_knotes() {
    let mut w = setup();
    w.fs.add_file(ROOT_INO, "watched", FileMode::IFREG | 0o644, 0);

    let fd = run_client(&mut w, |k| {
        k.open_path("/watched", OpenFlags::READ | OpenFlags::WRITE)
    })
    .unwrap();
    let kq = run_client(&mut w, |k| k.sys_kqueue()).unwrap();
    run_client(&mut w, |k| {
        k.sys_kevent_add(kq, fd, NoteFlags::NOTE_WRITE | NoteFlags::NOTE_EXTEND)
    })
    .unwrap();

    run_client(&mut w, |k| k.write_fd(fd, b"grow")).unwrap();
    let events = run_client(&mut w, |k| k.sys_kevent_drain(kq)).unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].1.contains(NoteFlags::NOTE_WRITE));
    assert!(events[0].1.contains(NoteFlags::NOTE_EXTEND));
}

#[test]
fn truncate_requires_regular_file() {
    let mut w = setup();
    w.fs.add_file(ROOT_INO, "file", FileMode::IFREG | 0o644, 0);
    let fd = run_client(&mut w, |k| {
        k.open_path("/file", OpenFlags::READ | OpenFlags::WRITE)
    })
    .unwrap();
    run_client(&mut w, |k| k.write_fd(fd, &[7u8; 100])).unwrap();
    run_client(&mut w, |k| k.sys_truncate(fd, 10)).unwrap();
    let fd2 = run_client(&mut w, |k| k.open_path("/file", OpenFlags::READ)).unwrap();
    let data = run_client(&mut w, |k| k.read_fd(fd2, 100)).unwrap();
    assert_eq!(data.len(), 10);
}

#[test]
fn unlink_removes_entry_and_invalidates_cache() {
    let mut w = setup();
    w.fs.add_file(ROOT_INO, "doomed", FileMode::IFREG | 0o644, 0);

    // Touch it once so the dname cache holds the binding.
    let fd = run_client(&mut w, |k| k.open_path("/doomed", OpenFlags::READ)).unwrap();
    run_client(&mut w, |k| k.sys_close(fd)).unwrap();

    run_client(&mut w, |k| k.sys_unlink("/doomed")).unwrap();

    // Gone on the server and out of the caches.
    let err = run_client(&mut w, |k| k.open_path("/doomed", OpenFlags::READ)).unwrap_err();
    assert_eq!(err, KernelError::Fs(malvern_kernel::error::FsError::NotFound));
    assert!(w.k.check_vnode_invariant());
}

#[test]
fn mknod_rejects_existing_paths() {
    let mut w = setup();
    w.fs.add_file(ROOT_INO, "present", FileMode::IFREG | 0o644, 0);
    let err = run_client(&mut w, |k| {
        k.sys_mknod("/present", 0, FileMode::IFREG | 0o644)
    })
    .unwrap_err();
    assert_eq!(
        err,
        KernelError::Fs(malvern_kernel::error::FsError::AlreadyExists)
    );

    run_client(&mut w, |k| k.sys_mknod("/fresh", 0, FileMode::IFREG | 0o600)).unwrap();
    let fd = run_client(&mut w, |k| k.open_path("/fresh", OpenFlags::READ)).unwrap();
    assert!(fd >= 0);
}

#[test]
fn readlink_rejects_non_symlinks() {
    let mut w = setup();
    w.fs.add_file(ROOT_INO, "plain", FileMode::IFREG | 0o644, 0);
    let err = run_client(&mut w, |k| k.sys_readlink("/plain", 64)).unwrap_err();
    assert_eq!(
        err,
        KernelError::Fs(malvern_kernel::error::FsError::NotSymlink)
    );

    run_client(&mut w, |k| k.sys_symlink("/ln", "/plain")).unwrap();
    let target = run_client(&mut w, |k| k.sys_readlink("/ln", 64)).unwrap();
    assert_eq!(target, b"/plain");
}

#[test]
fn close_frees_descriptor_even_for_shared_filps() {
    let mut w = setup();
    w.fs.add_file(ROOT_INO, "shared", FileMode::IFREG | 0o644, 0);
    let fd = run_client(&mut w, |k| k.open_path("/shared", OpenFlags::READ)).unwrap();

    // Duplicate the description by hand (as fork would).
    let client_pid = {
        let tid = w.client;
        w.k.threads.get(tid).unwrap().proc
    };
    let filp = w.k.procs.get(client_pid).unwrap().fd(fd).unwrap();
    w.k.filps.ref_filp(filp).unwrap();
    let fd2 = w
        .k
        .procs
        .get_mut(client_pid)
        .unwrap()
        .alloc_fd(filp)
        .unwrap() as i32;

    run_client(&mut w, |k| k.sys_close(fd)).unwrap();
    // The description survives the first close.
    assert!(w.k.filps.get(filp).is_ok());
    run_client(&mut w, |k| k.sys_close(fd2)).unwrap();
    assert!(w.k.filps.get(filp).is_err());
    assert!(w.k.check_vnode_invariant());
}

#[test]
fn char_device_write_goes_to_server() {
    let mut w = setup();
    w.fs
        .add_file(ROOT_INO, "tty0", FileMode::IFCHR | 0o666, 0);
    let fd = run_client(&mut w, |k| k.open_path("/tty0", OpenFlags::WRITE)).unwrap();
    let n = run_client(&mut w, |k| k.write_fd(fd, b"console says hi")).unwrap();
    assert_eq!(n, 15);
    // The bytes reached the server synchronously.
    let ino = w.fs.dirs[&ROOT_INO]["tty0"].ino;
    assert_eq!(w.fs.data[&(ino, 0)], b"console says hi");
}
