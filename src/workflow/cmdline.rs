//! Installer location and kernel command line.

use crate::source::InstallationSource;

use super::error::SetupError;

/// Optional installer boot arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootOptions {
    pub inst_graphical: bool,
    pub serial_console: bool,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            inst_graphical: true,
            serial_console: true,
        }
    }
}

/// Extra kernel arguments appended after the generated ones, in order
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtraArgs<'a> {
    pub case: Option<&'a str>,
    pub all: Option<&'a str>,
    pub arch: Option<&'a str>,
}

fn base_tree<'a>(source: &'a InstallationSource, arch: &str) -> Result<&'a str, SetupError> {
    source
        .os_url(source.base_repo_id(), arch)
        .ok_or_else(|| SetupError::NoInstallTree {
            repo: source.base_repo_id().to_string(),
            arch: arch.to_string(),
        })
}

/// `virt-install --location` value for `arch`.
///
/// Includes the kernel and initrd only when both are known.
pub fn install_location(source: &InstallationSource, arch: &str) -> Result<String, SetupError> {
    let os = base_tree(source, arch)?;
    match (source.kernel_path(arch), source.initrd_path(arch)) {
        (Some(kernel), Some(initrd)) => Ok(format!("{},kernel={},initrd={}", os, kernel, initrd)),
        _ => Ok(os.to_string()),
    }
}

/// Installer kernel command line for `arch`.
pub fn kernel_cmdline(
    source: &InstallationSource,
    arch: &str,
    additional_repos: &[String],
    extra: ExtraArgs<'_>,
    options: BootOptions,
) -> Result<String, SetupError> {
    let os = base_tree(source, arch)?;

    let mut args = vec![
        "inst.sshd".to_string(),
        "inst.webui".to_string(),
        "inst.webui.remote".to_string(),
    ];
    if options.inst_graphical {
        args.push("inst.graphical".to_string());
    }
    if options.serial_console {
        args.push("console=ttyS0".to_string());
    }
    args.push(format!("inst.stage2={}", os));

    for repo in additional_repos {
        let url = source
            .os_url(repo, arch)
            .ok_or_else(|| SetupError::NoInstallTree {
                repo: repo.clone(),
                arch: arch.to_string(),
            })?;
        args.push(format!("inst.addrepo={},{}", repo, url));
    }

    for extra in [extra.case, extra.all, extra.arch].into_iter().flatten() {
        let extra = extra.trim();
        if !extra.is_empty() {
            args.push(extra.to_string());
        }
    }

    Ok(args.join(" "))
}
