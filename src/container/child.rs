//! The container's first process, between clone and exec

use crate::{
    abort,
    container::builder::ChildPlan,
    errors::Error,
    handshake::ChildHandshake,
    mount, resource,
    subprocess::{close_fds_except, null_stdio, UNHANDLED_FAILURE},
};
use nix::unistd::{chdir, chroot, execvp, sethostname};
use std::{
    collections::HashSet,
    convert::Infallible,
    fs,
    panic::{catch_unwind, AssertUnwindSafe},
    path::Path,
};

const PSEUDO_FILESYSTEMS: [(&str, &str); 2] = [("proc", "proc"), ("sysfs", "sys")];

/// Runs in the cloned child. Only returns if setup failed.
pub(crate) fn run(plan: &ChildPlan, mut handshake: ChildHandshake) -> i32 {
    match catch_unwind(AssertUnwindSafe(|| setup_and_exec(plan, &mut handshake))) {
        Ok(Ok(never)) => match never {},
        Ok(Err(err)) => log::error!("container setup failed, {}", err),
        Err(_) => log::error!("container setup panicked"),
    }
    handshake.fail();
    UNHANDLED_FAILURE
}

fn setup_and_exec(plan: &ChildPlan, handshake: &mut ChildHandshake) -> Result<Infallible, Error> {
    abort::reset_handlers()?;
    close_fds_except(&handshake.fds())?;
    if plan.user_namespace {
        handshake.wait_proceed()?;
    }

    mount::make_private(Path::new("/"))?;
    sethostname(&plan.hostname)?;

    let mut own_mounts = HashSet::new();
    for spec in &plan.mounts {
        let target = spec.host_target(&plan.root);
        if !target.exists() {
            fs::create_dir_all(&target)?;
        }
        mount::bind_mount(&spec.source, &target, spec.read_only)?;
        own_mounts.insert(target);
    }
    if plan.pseudo_filesystems {
        for (fstype, dir) in PSEUDO_FILESYSTEMS.iter() {
            let target = plan.root.join(dir);
            if !target.exists() {
                fs::create_dir_all(&target)?;
            }
            mount::mount_pseudo(fstype, &target)?;
            own_mounts.insert(target);
        }
    }
    let removed = mount::unmount_foreign(&own_mounts)?;
    log::debug!("detached {} mounts that belong to the host", removed);

    for file in &plan.files {
        resource::create_file(&plan.root, &file.path, &file.contents, file.mode)?;
    }

    handshake.ready()?;
    handshake.wait_release()?;

    if let Some(endpoint) = &plan.endpoint {
        endpoint.finish_configuration()?;
    }
    log::debug!("exec {:?}", plan.argv);
    if plan.null_stdio {
        null_stdio()?;
    }
    chroot(plan.root.as_path())?;
    chdir("/")?;
    let never = execvp(&plan.argv[0], &plan.argv)?;
    Ok(never)
}
