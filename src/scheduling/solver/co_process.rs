//! Co-process solver transport: the problem goes down a pipe to an external
//! min-cost-flow binary, the flow comes back on its stdout. A reader thread
//! hands the output to a crossbeam channel so the optional wall-clock
//! deadline can be enforced with `recv_timeout`.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::scheduling::solver::FlowSolver;

pub struct CoProcessSolver {
    binary: String,
}

impl CoProcessSolver {
    pub fn new(binary: &str) -> Self {
        CoProcessSolver {
            binary: binary.to_string(),
        }
    }
}

impl FlowSolver for CoProcessSolver {
    fn solve(&mut self, problem: &str, deadline: Option<Duration>) -> anyhow::Result<String> {
        let mut child = Command::new(&self.binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| anyhow!("failed to spawn solver `{}`: {}", self.binary, e))?;

        {
            let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("solver stdin"))?;
            stdin
                .write_all(problem.as_bytes())
                .map_err(|e| anyhow!("failed to write problem to solver: {}", e))?;
            // dropping the handle closes the pipe and lets the solver run
        }

        let mut stdout = child.stdout.take().ok_or_else(|| anyhow!("solver stdout"))?;
        let (sender, receiver) = crossbeam::channel::bounded(1);
        let _reader = crate::utils::thread::spawn("solver-reader", move || {
            let mut output = String::new();
            let result = stdout
                .read_to_string(&mut output)
                .map(|_n| output)
                .map_err(|e| anyhow!("failed to read solver output: {}", e));
            let _ = sender.send(result);
        });

        let output = match deadline {
            Some(deadline) => match receiver.recv_timeout(deadline) {
                Ok(result) => result?,
                Err(_timeout) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    bail!("solver exceeded deadline of {:?}", deadline);
                }
            },
            None => receiver
                .recv()
                .map_err(|e| anyhow!("solver reader died: {}", e))??,
        };

        let status = child
            .wait()
            .map_err(|e| anyhow!("failed to reap solver: {}", e))?;
        if !status.success() {
            bail!("solver exited with {}", status);
        }
        Ok(output)
    }
}
