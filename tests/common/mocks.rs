//! Fakes for the process runner and the front-end proxy

use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use simple_deploy_hook::error::DeployError;
use simple_deploy_hook::pipeline::{CommandOutput, Invocation, ProcessRunner};
use simple_deploy_hook::publisher::ProxyControl;

/// Records every invocation. The `build` step writes `output_files` files
/// into `<cwd>/dist`, after an optional delay.
pub struct FakeRunner {
    pub calls: Mutex<Vec<String>>,
    pub fail_step: Mutex<Option<String>>,
    pub output_files: AtomicUsize,
    pub build_delay: Mutex<Duration>,
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_step: Mutex::new(None),
            output_files: AtomicUsize::new(3),
            build_delay: Mutex::new(Duration::ZERO),
        }
    }
}

impl FakeRunner {
    pub fn steps(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_on(&self, step: &str) {
        *self.fail_step.lock().unwrap() = Some(step.to_string());
    }

    pub fn clear_failure(&self) {
        *self.fail_step.lock().unwrap() = None;
    }

    pub fn set_output_files(&self, count: usize) {
        self.output_files.store(count, Ordering::SeqCst);
    }

    pub fn set_build_delay(&self, delay: Duration) {
        *self.build_delay.lock().unwrap() = delay;
    }

    fn write_output(cwd: &Path, count: usize) {
        if count == 0 {
            return;
        }
        let dist = cwd.join("dist");
        std::fs::create_dir_all(&dist).unwrap();
        std::fs::write(dist.join("index.html"), "<html>site</html>").unwrap();
        for i in 1..count {
            std::fs::write(dist.join(format!("asset-{}.js", i)), format!("// {}", i)).unwrap();
        }
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, DeployError> {
        self.calls.lock().unwrap().push(invocation.step.clone());

        let fail = self.fail_step.lock().unwrap().clone();
        if fail.as_deref() == Some(invocation.step.as_str()) {
            return Ok(CommandOutput {
                exit_code: Some(1),
                stdout: String::new(),
                stderr: format!("{} exploded", invocation.step),
            });
        }

        if invocation.step == "build" {
            let delay = *self.build_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Self::write_output(&invocation.cwd, self.output_files.load(Ordering::SeqCst));
        }

        Ok(CommandOutput {
            exit_code: Some(0),
            stdout: format!("{} ok", invocation.step),
            stderr: String::new(),
        })
    }
}

#[derive(Default)]
pub struct FakeProxy {
    pub dead: AtomicBool,
    pub reloads: AtomicUsize,
}

#[async_trait]
impl ProxyControl for FakeProxy {
    async fn reload(&self) -> Result<(), DeployError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_alive(&self) -> Result<bool, DeployError> {
        Ok(!self.dead.load(Ordering::SeqCst))
    }
}
