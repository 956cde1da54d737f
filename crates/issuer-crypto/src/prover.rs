use crate::zk::{CircuitId, ProofData, ZkProof};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Default wall-clock limit for one witness + proof run.
pub const DEFAULT_PROVER_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum ProverError {
    #[error("prover io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{step} exited with {status}: {stderr}")]
    CommandFailed {
        step: &'static str,
        status: String,
        stderr: String,
    },
    #[error("{step} timed out after {secs} seconds")]
    Timeout { step: &'static str, secs: u64 },
    #[error("missing circuit artifact: {0}")]
    MissingArtifact(String),
    #[error("unreadable prover output: {0}")]
    Output(String),
}

/// Produces Groth16 proofs for circuit inputs.
#[async_trait]
pub trait Prover: Send + Sync {
    /// # Errors
    ///
    /// Returns a [`ProverError`] when the witness or proof step fails.
    async fn prove(&self, circuit: CircuitId, inputs: &serde_json::Value)
        -> Result<ZkProof, ProverError>;
}

/// Runs the circom witness generator under node, then a rapidsnark-style
/// prover binary.
///
/// Artifacts are expected at `<circuits_dir>/<circuit>/`:
/// `circuit.wasm`, `generate_witness.js` and `circuit_final.zkey`.
#[derive(Debug, Clone)]
pub struct NativeProver {
    circuits_dir: PathBuf,
    node_bin: PathBuf,
    prover_bin: PathBuf,
    timeout: Duration,
}

impl NativeProver {
    pub fn new(circuits_dir: impl Into<PathBuf>) -> Self {
        Self {
            circuits_dir: circuits_dir.into(),
            node_bin: PathBuf::from("node"),
            prover_bin: PathBuf::from("rapidsnark"),
            timeout: DEFAULT_PROVER_TIMEOUT,
        }
    }

    pub fn with_node_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.node_bin = bin.into();
        self
    }

    pub fn with_prover_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.prover_bin = bin.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn artifact(&self, circuit: CircuitId, name: &str) -> Result<PathBuf, ProverError> {
        let path = self.circuits_dir.join(circuit.as_str()).join(name);
        if !path.exists() {
            return Err(ProverError::MissingArtifact(path.display().to_string()));
        }
        Ok(path)
    }

    async fn run(&self, step: &'static str, command: &mut Command) -> Result<(), ProverError> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn()?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ProverError::Timeout {
                step,
                secs: self.timeout.as_secs(),
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ProverError::CommandFailed {
                step,
                status: output.status.to_string(),
                stderr,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Prover for NativeProver {
    async fn prove(
        &self,
        circuit: CircuitId,
        inputs: &serde_json::Value,
    ) -> Result<ZkProof, ProverError> {
        let wasm = self.artifact(circuit, "circuit.wasm")?;
        let witness_gen = self.artifact(circuit, "generate_witness.js")?;
        let zkey = self.artifact(circuit, "circuit_final.zkey")?;

        let work = tempfile::tempdir()?;
        let input_path = work.path().join("input.json");
        let witness_path = work.path().join("witness.wtns");
        let proof_path = work.path().join("proof.json");
        let public_path = work.path().join("public.json");

        let input = serde_json::to_vec(inputs).map_err(|e| ProverError::Output(e.to_string()))?;
        tokio::fs::write(&input_path, input).await?;

        let started = std::time::Instant::now();
        self.run(
            "witness",
            Command::new(&self.node_bin)
                .arg(&witness_gen)
                .arg(&wasm)
                .arg(&input_path)
                .arg(&witness_path),
        )
        .await?;

        self.run(
            "prove",
            Command::new(&self.prover_bin)
                .arg(&zkey)
                .arg(&witness_path)
                .arg(&proof_path)
                .arg(&public_path),
        )
        .await?;

        let proof = read_output(&proof_path, &public_path).await?;
        tracing::debug!(
            circuit = circuit.as_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "generated proof"
        );
        Ok(proof)
    }
}

async fn read_output(proof_path: &Path, public_path: &Path) -> Result<ZkProof, ProverError> {
    let proof_raw = tokio::fs::read(proof_path).await?;
    let public_raw = tokio::fs::read(public_path).await?;
    let proof: ProofData =
        serde_json::from_slice(&proof_raw).map_err(|e| ProverError::Output(e.to_string()))?;
    let pub_signals: Vec<String> =
        serde_json::from_slice(&public_raw).map_err(|e| ProverError::Output(e.to_string()))?;
    Ok(ZkProof { proof, pub_signals })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_artifacts_are_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prover = NativeProver::new(dir.path());
        let err = prover
            .prove(CircuitId::StateTransition, &serde_json::json!({}))
            .await
            .expect_err("no artifacts present");
        match err {
            ProverError::MissingArtifact(path) => assert!(path.contains("stateTransition")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn reads_snarkjs_output_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let proof_path = dir.path().join("proof.json");
        let public_path = dir.path().join("public.json");
        std::fs::write(
            &proof_path,
            r#"{"pi_a":["1","2","1"],"pi_b":[["1","2"],["3","4"],["1","0"]],"pi_c":["5","6","1"],"protocol":"groth16","curve":"bn128"}"#,
        )
        .expect("write proof");
        std::fs::write(&public_path, r#"["11","22"]"#).expect("write public");

        let proof = read_output(&proof_path, &public_path)
            .await
            .expect("output parses");
        assert_eq!(proof.pub_signals, vec!["11", "22"]);
        assert_eq!(proof.proof.pi_a[0], "1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_step_surfaces_stderr() {
        let dir = tempfile::tempdir().expect("tempdir");
        let circuit_dir = dir.path().join("authV2");
        std::fs::create_dir_all(&circuit_dir).expect("mkdir");
        for name in ["circuit.wasm", "generate_witness.js", "circuit_final.zkey"] {
            std::fs::write(circuit_dir.join(name), b"").expect("write artifact");
        }
        let prover = NativeProver::new(dir.path()).with_node_bin("false");
        let err = prover
            .prove(CircuitId::AuthV2, &serde_json::json!({"a": "1"}))
            .await
            .expect_err("false exits non-zero");
        assert!(matches!(err, ProverError::CommandFailed { step: "witness", .. }));
    }
}
