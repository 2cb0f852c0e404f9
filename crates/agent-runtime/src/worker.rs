//! Isolate worker threads.
//!
//! Each isolate owns one OS thread running [`run_worker`]. The thread holds
//! the wasmtime store; nothing else touches it.

use tokio::sync::mpsc;
use tracing::{debug, info_span};

use crate::protocol::{IsolateRequest, IsolateResponse};
use crate::sandbox::{IsolateRuntime, WasmSandbox};

#[derive(Debug, Clone, thiserror::Error)]
#[error("isolate worker {0} has exited")]
pub struct IsolateClosed(pub String);

/// Controller-side handle to an isolate worker.
pub struct IsolateHandle {
    label: String,
    tx: mpsc::UnboundedSender<IsolateRequest>,
}

impl IsolateHandle {
    pub fn spawn(sandbox: WasmSandbox, label: impl Into<String>) -> std::io::Result<Self> {
        let label = label.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let worker_label = label.clone();
        std::thread::Builder::new()
            .name(format!("agent-{label}"))
            .spawn(move || run_worker(sandbox, worker_label, rx))?;
        Ok(Self { label, tx })
    }

    pub fn send(&self, request: IsolateRequest) -> Result<(), IsolateClosed> {
        self.tx
            .send(request)
            .map_err(|_| IsolateClosed(self.label.clone()))
    }

    /// Queue termination. The worker zeroes the isolate once any running
    /// call returns.
    pub fn terminate(&self) {
        let _ = self.tx.send(IsolateRequest::Terminate);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Drop for IsolateHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Worker loop: serve requests until `Terminate` or the handle is dropped.
pub fn run_worker(
    sandbox: WasmSandbox,
    label: String,
    mut rx: mpsc::UnboundedReceiver<IsolateRequest>,
) {
    let _span = info_span!("isolate", agent = %label).entered();
    let mut runtime: Option<IsolateRuntime> = None;

    while let Some(request) = rx.blocking_recv() {
        match request {
            IsolateRequest::Instantiate {
                id,
                module,
                permissions,
                limits,
                reply,
            } => {
                if let Some(mut old) = runtime.take() {
                    old.terminate();
                }
                let instantiated =
                    IsolateRuntime::instantiate(&sandbox, &label, &module, permissions, limits);
                let response = match instantiated {
                    Ok(rt) => {
                        runtime = Some(rt);
                        IsolateResponse::InstantiateOk { id }
                    }
                    Err(e) => IsolateResponse::InstantiateErr {
                        id,
                        reason: e.to_string(),
                    },
                };
                let _ = reply.send(response);
            }
            IsolateRequest::Call {
                id,
                entry,
                input,
                reply,
            } => {
                debug!(request_id = id, entry = entry.export_name(), "call");
                let result = match runtime.as_mut() {
                    Some(rt) => rt.call(entry, input),
                    None => Err(crate::protocol::CallFailure::NotInstantiated),
                };
                let response = match result {
                    Ok(output) => IsolateResponse::CallOk { id, output },
                    Err(failure) => IsolateResponse::CallErr { id, failure },
                };
                // A dropped receiver means the controller already gave up on
                // this request.
                let _ = reply.send(response);
            }
            IsolateRequest::UpdateContext { context } => {
                if let Some(rt) = runtime.as_mut() {
                    rt.update_context(context);
                }
            }
            IsolateRequest::Terminate => break,
        }
    }

    if let Some(mut rt) = runtime.take() {
        rt.terminate();
    }
    debug!("worker exited");
}
