//! Thin wrappers around the OS calls the tracer needs: CPU affinity,
//! scheduling priority and host identification.

use std::io;
use std::mem;

/// Pins the calling process (or the child, when called from `pre_exec`)
/// to a single core.
pub fn pin_to_core(core: u32) -> io::Result<()> {
    let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
    unsafe {
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core as usize, &mut set);
    }
    set_affinity(&set)
}

/// Resets the affinity mask to every possible core. Used for the child,
/// which would otherwise inherit the parent's single-core mask.
pub fn allow_all_cores() -> io::Result<()> {
    let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
    unsafe {
        libc::CPU_ZERO(&mut set);
        for core in 0..libc::CPU_SETSIZE as usize {
            libc::CPU_SET(core, &mut set);
        }
    }
    set_affinity(&set)
}

fn set_affinity(set: &libc::cpu_set_t) -> io::Result<()> {
    if unsafe { libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), set) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Raises the scheduling priority of this process, so that the sampler keeps
/// up with the timer while the child loads the machine.
/// Needs CAP_SYS_NICE, which is usually available since reading the counters
/// already requires elevated privileges.
pub fn raise_priority() -> io::Result<()> {
    if unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, -5) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn cpus_available() -> i64 {
    unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) as i64 }
}

pub fn cpus_online() -> i64 {
    unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) as i64 }
}

#[derive(Debug)]
pub struct Uname {
    pub sysname: String,
    pub nodename: String,
    pub release: String,
    pub version: String,
    pub machine: String,
}

/// Identification of the host kernel and architecture, from `uname(2)`.
pub fn uname() -> io::Result<Uname> {
    let mut raw: libc::utsname = unsafe { mem::zeroed() };
    if unsafe { libc::uname(&mut raw) } < 0 {
        return Err(io::Error::last_os_error());
    }

    fn field(chars: &[libc::c_char]) -> String {
        let bytes: Vec<u8> = chars.iter().take_while(|&&c| c != 0).map(|&c| c as u8).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    Ok(Uname {
        sysname: field(&raw.sysname),
        nodename: field(&raw.nodename),
        release: field(&raw.release),
        version: field(&raw.version),
        machine: field(&raw.machine),
    })
}

#[cfg(test)]
mod tests {
    use super::uname;

    #[test]
    fn test_uname() {
        let info = uname().expect("uname should not fail");
        assert!(!info.sysname.is_empty());
        assert!(!info.release.is_empty());
        assert!(!info.machine.is_empty());
    }
}
