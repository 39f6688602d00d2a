//! Pipeline executor: turns a [`Pipeline`] into a running chain of
//! execution nodes and supervises it.
//!
//! The operator chain is type-checked before any node exists. The executor
//! then spawns one node per operator, starts the sink-most node with the
//! handles of all nodes before it (the start cascades upstream), and waits
//! for every node to terminate. The first node to fail brings the whole
//! chain down; the error reported is the one of the most upstream failed
//! node, which is where a failure originates.

use crate::error::{PipelineError, Result};
use crate::pipeline::bridge::{ExitReason, NodeHandle, PullReply, SinkHandle, SinkReceiver};
use crate::pipeline::chain::Pipeline;
use crate::pipeline::context::EngineContext;
use crate::pipeline::element::{Batch, ElementType};
use crate::pipeline::node::spawn_exec_node;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct PipelineExecutor {
    pipeline: Option<Pipeline>,
    engine: EngineContext,
    nodes: Vec<NodeHandle>,
    output: ElementType,
}

impl PipelineExecutor {
    pub fn new(pipeline: Pipeline, engine: EngineContext) -> Self {
        Self {
            pipeline: Some(pipeline),
            engine,
            nodes: Vec::new(),
            output: ElementType::Void,
        }
    }

    /// Spawn and start all nodes. Resolves once every node was
    /// instantiated.
    pub async fn start(&mut self) -> Result<()> {
        let Some(pipeline) = self.pipeline.take() else {
            return Err(PipelineError::logic("pipeline was already started"));
        };
        if pipeline.is_empty() {
            return Err(PipelineError::logic("cannot execute an empty pipeline"));
        }
        pipeline.infer_type(ElementType::Void)?;
        let pipeline = if self.engine.config().optimize {
            pipeline.optimize_if_closed()
        } else {
            pipeline
        };

        let mut input = ElementType::Void;
        for op in pipeline.into_operators() {
            match spawn_exec_node(op, input, &self.engine) {
                Ok((handle, output)) => {
                    self.nodes.push(handle);
                    input = output;
                }
                Err(err) => {
                    self.shutdown();
                    return Err(err);
                }
            }
        }
        self.output = input;

        let mut previous = self.nodes.clone();
        let Some(last) = previous.pop() else {
            return Err(PipelineError::logic("cannot execute an empty pipeline"));
        };
        if let Err(err) = last.start(previous).await {
            self.shutdown();
            return Err(err);
        }
        tracing::info!(
            "Started pipeline of {} execution nodes ({} output)",
            self.nodes.len(),
            self.output
        );
        Ok(())
    }

    /// Wait until every node terminated.
    pub async fn wait(&mut self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(PipelineError::logic("pipeline was not started"));
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        for (index, node) in self.nodes.iter().enumerate() {
            let node = node.clone();
            let tx = tx.clone();
            self.engine.runtime().spawn(async move {
                let reason = node.terminated().await;
                let _ = tx.send((index, reason));
            });
        }
        drop(tx);

        let mut exits: Vec<Option<ExitReason>> = vec![None; self.nodes.len()];
        let mut failing = false;
        while let Some((index, reason)) = rx.recv().await {
            if reason.is_error() && !failing {
                failing = true;
                tracing::debug!(
                    "{} `{}` failed; shutting down the pipeline",
                    self.nodes[index].id(),
                    self.nodes[index].operator()
                );
                self.shutdown();
            }
            exits[index] = Some(reason);
        }

        for (node, exit) in self.nodes.iter().zip(&exits) {
            if let Some(ExitReason::Error(diag)) = exit {
                return Err(PipelineError::NodeFailed {
                    node: node.id(),
                    operator: node.operator().to_string(),
                    reason: diag.clone(),
                });
            }
        }
        tracing::info!("Pipeline completed");
        Ok(())
    }

    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        self.wait().await
    }

    pub fn pause(&self) {
        for node in &self.nodes {
            node.pause();
        }
    }

    pub fn resume(&self) {
        for node in &self.nodes {
            node.resume();
        }
    }

    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown(ExitReason::Normal);
        }
    }

    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }

    /// Output type of the started pipeline.
    pub fn output_type(&self) -> ElementType {
        self.output
    }

    /// Reader over the pipeline's output, for pipelines that do not end in
    /// a sink. Only one reader may be active at a time.
    pub fn output(&self) -> Option<OutputReader> {
        if self.output == ElementType::Void {
            return None;
        }
        let last = self.nodes.last()?.clone();
        let demand = self.engine.config().demand_for(self.output);
        Some(OutputReader::new(last, demand.max_batch_size, demand.batch_timeout()))
    }
}

impl Drop for PipelineExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Pulls batches from the last node of a pipeline.
pub struct OutputReader {
    node: NodeHandle,
    sink: SinkHandle,
    incoming: SinkReceiver,
    batch_size: u64,
    batch_timeout: Duration,
    done: bool,
}

impl OutputReader {
    pub fn new(node: NodeHandle, batch_size: u64, batch_timeout: Duration) -> Self {
        let (sink, incoming) = SinkHandle::channel();
        Self {
            node,
            sink,
            incoming,
            batch_size,
            batch_timeout,
            done: false,
        }
    }

    /// Next batch, or `None` once the pipeline is exhausted.
    pub async fn next(&mut self) -> Result<Option<Batch>> {
        while !self.done {
            let mut reply = self
                .node
                .send_pull(self.sink.clone(), self.batch_size, self.batch_timeout);
            let reply = tokio::select! {
                push = self.incoming.recv() => {
                    // We hold a sink handle ourselves, so the channel is open.
                    let Some(push) = push else { return Ok(None) };
                    let batch = push.accept();
                    return match (&mut reply).await {
                        Ok(Ok(_)) => Ok(Some(batch)),
                        Ok(Err(err)) => Err(err),
                        Err(_) => self.failure().await.map(|_| Some(batch)),
                    };
                }
                reply = &mut reply => reply,
            };
            match reply {
                Ok(Ok(PullReply::Delivered { .. })) => {}
                Ok(Ok(PullReply::Exhausted)) => {
                    self.done = true;
                    self.failure().await?;
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    self.done = true;
                    self.failure().await?;
                }
            }
        }
        Ok(None)
    }

    async fn failure(&self) -> Result<()> {
        match self.node.terminated().await {
            ExitReason::Normal => Ok(()),
            ExitReason::Error(reason) => Err(PipelineError::NodeFailed {
                node: self.node.id(),
                operator: self.node.operator().to_string(),
                reason,
            }),
        }
    }
}
