//! Compiler cache shared between builds of the same root.

use std::fs;
use std::path::PathBuf;

use tracing::info;

use super::{HookEnv, HookRegistry, Plugin, Stage};
use crate::config::{BuildrootPaths, CcacheOptions};
use crate::error::PluginError;
use crate::sandbox::{ChrootCommand, MountSpec};

const NAME: &str = "ccache";

/// Cache directory as seen from inside the root.
pub const CHROOT_CCACHE_DIR: &str = "/tmp/ccache";

/// Bind-mounts `<cachedir>/ccache` at `/tmp/ccache` and sizes the cache before builds.
#[derive(Debug, Clone)]
pub struct Ccache {
    options: CcacheOptions,
    host_dir: PathBuf,
}

impl Ccache {
    #[must_use]
    pub fn new(options: CcacheOptions, paths: &BuildrootPaths) -> Self {
        Self {
            options,
            host_dir: paths.ccache_dir.clone(),
        }
    }
}

fn io_error(context: String) -> impl FnOnce(std::io::Error) -> PluginError {
    move |source| PluginError::Io {
        plugin: NAME.to_string(),
        context,
        source,
    }
}

impl Plugin for Ccache {
    fn name(&self) -> &'static str {
        NAME
    }

    fn mounts(&self, paths: &BuildrootPaths) -> Vec<MountSpec> {
        vec![MountSpec::bind(&self.host_dir, paths.in_root(CHROOT_CCACHE_DIR))]
    }

    fn register(&self, registry: &mut HookRegistry) {
        let host_dir = self.host_dir.clone();
        registry.add(Stage::Preinit, NAME, "create cache dirs", move |env| {
            info!("enabled ccache");
            let inner = env.paths.in_root(CHROOT_CCACHE_DIR);
            fs::create_dir_all(&inner).map_err(io_error(format!("create {}", inner.display())))?;
            fs::create_dir_all(&host_dir)
                .map_err(io_error(format!("create {}", host_dir.display())))?;
            env.env
                .insert("CCACHE_DIR".to_string(), CHROOT_CCACHE_DIR.to_string());
            env.env.insert("CCACHE_UMASK".to_string(), "002".to_string());
            Ok(())
        });

        let size = self.options.max_cache_size.clone();
        registry.add(
            Stage::Prebuild,
            NAME,
            format!("ccache -M {size}"),
            move |env: &mut HookEnv<'_>| {
                let (uid, gid) = env.chroot_user;
                let command = ChrootCommand::new(["ccache", "-M", size.as_str()])
                    .in_root(&env.paths.rootdir)
                    .as_user(uid, gid)
                    .with_envs(env.env.iter());
                let output = env.runner.run(&command).map_err(|e| PluginError::Hook {
                    plugin: NAME.to_string(),
                    reason: e.to_string(),
                })?;
                if output.success() {
                    Ok(())
                } else {
                    Err(PluginError::Hook {
                        plugin: NAME.to_string(),
                        reason: format!("ccache -M exited with {}", output.exit_code),
                    })
                }
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use crate::error::ExecError;
    use crate::sandbox::{CommandOutput, CommandRunner, LockTable};
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        commands: RefCell<Vec<ChrootCommand>>,
        exit_code: i32,
    }

    impl CommandRunner for Recorder {
        fn run(&self, command: &ChrootCommand) -> Result<CommandOutput, ExecError> {
            self.commands.borrow_mut().push(command.clone());
            Ok(CommandOutput {
                exit_code: self.exit_code,
                ..CommandOutput::default()
            })
        }
    }

    fn config(tmp: &TempDir) -> BuildConfig {
        let base = tmp.path();
        BuildConfig::default()
            .with_basedir(base.join("lib"))
            .with_cache_topdir(base.join("cache"))
    }

    #[test]
    fn test_preinit_creates_dirs_and_sets_env() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let config = config(&tmp);
        let paths = config.paths();
        let plugin = Ccache::new(config.plugins.ccache.clone(), &paths);
        let mut registry = HookRegistry::new();
        plugin.register(&mut registry);

        let runner = Recorder::default();
        let mut locks = LockTable::new();
        let mut vars = BTreeMap::new();
        let mut env = HookEnv {
            paths: &paths,
            locks: &mut locks,
            env: &mut vars,
            runner: &runner,
            chroot_user: (1000, 1000),
        };

        assert_eq!(registry.call(Stage::Preinit, &mut env), 0);
        assert!(paths.rootdir.join("tmp/ccache").is_dir());
        assert!(paths.ccache_dir.is_dir());
        assert_eq!(vars.get("CCACHE_DIR").map(String::as_str), Some("/tmp/ccache"));
        assert_eq!(vars.get("CCACHE_UMASK").map(String::as_str), Some("002"));
    }

    #[test]
    fn test_prebuild_runs_ccache_in_root() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let config = config(&tmp);
        let paths = config.paths();
        let plugin = Ccache::new(config.plugins.ccache.clone(), &paths);
        let mut registry = HookRegistry::new();
        plugin.register(&mut registry);

        let runner = Recorder::default();
        let mut locks = LockTable::new();
        let mut vars = BTreeMap::new();
        vars.insert("CCACHE_DIR".to_string(), "/tmp/ccache".to_string());
        let mut env = HookEnv {
            paths: &paths,
            locks: &mut locks,
            env: &mut vars,
            runner: &runner,
            chroot_user: (1000, 135),
        };
        assert_eq!(registry.call(Stage::Prebuild, &mut env), 0);

        let commands = runner.commands.borrow();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].argv(), ["ccache", "-M", "4G"]);
        assert_eq!(commands[0].root(), Some(paths.rootdir.as_path()));
        assert_eq!(commands[0].user(), Some((1000, 135)));
        assert_eq!(
            commands[0].env().get("CCACHE_DIR").map(String::as_str),
            Some("/tmp/ccache")
        );
    }

    #[test]
    fn test_prebuild_failure_is_counted() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let config = config(&tmp);
        let paths = config.paths();
        let plugin = Ccache::new(config.plugins.ccache.clone(), &paths);
        let mut registry = HookRegistry::new();
        plugin.register(&mut registry);

        let runner = Recorder {
            exit_code: 1,
            ..Recorder::default()
        };
        let mut locks = LockTable::new();
        let mut vars = BTreeMap::new();
        let mut env = HookEnv {
            paths: &paths,
            locks: &mut locks,
            env: &mut vars,
            runner: &runner,
            chroot_user: (1000, 135),
        };
        assert_eq!(registry.call(Stage::Prebuild, &mut env), 1);
    }

    #[test]
    fn test_bind_mount() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let config = config(&tmp);
        let paths = config.paths();
        let plugin = Ccache::new(config.plugins.ccache.clone(), &paths);
        let mounts = plugin.mounts(&paths);
        assert_eq!(mounts.len(), 1);
        assert!(mounts[0].is_bind());
        assert_eq!(mounts[0].target, paths.rootdir.join("tmp/ccache"));
    }
}
