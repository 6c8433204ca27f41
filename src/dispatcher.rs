//! Command routing on the control channel.
//!
//! Every request starts with a tag frame naming the command. The dispatcher
//! decodes the remaining frames, runs the command and sends exactly one
//! reply. Failures are answered with an error reply of fixed shape:
//!
//! 1. the error marker
//! 2. the engine→wire remap buffer of the decoded topology (empty if none)
//! 3. `[b]message[/b]`, every cause joined with `: `
//! 4. `\n[b]Traceback:[/b]`
//! 5. the rendered cause chain
//!
//! Frames of a failed request that were never read are discarded first so the
//! next request starts on its own tag frame.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use thiserror::Error;

use crate::engine::ForceFieldList;
use crate::payload::{self, Header, PayloadReader, SimulationParameters, StateRecord, TopologyRecord};
use crate::simulation::{Orchestrator, RelaxRequest, SimulationRequest};
use crate::structure::{ImportRequest, StructureIo};
use crate::topology::Topology;
use crate::transport::{self, ControlChannel, Frame};
use crate::virtual_objects::VirtualObjects;

pub const ERROR_MARKER: &str = "err";
const RUNNING: &str = "Running";
const ACK: &str = "ack";
const SUCCESS: &str = "SUCCESS";

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("{0} frame is not valid UTF-8")]
    InvalidText(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Relax,
    Simulate,
    AbortSimulation,
    ImportFile,
    ExportFile,
    GetProcessId,
    Quit,
}

impl Command {
    pub fn from_tag(tag: &[u8]) -> Result<Self, Error> {
        match tag {
            b"Relax" => Ok(Command::Relax),
            b"Simulate" => Ok(Command::Simulate),
            b"AbortSimulation" => Ok(Command::AbortSimulation),
            b"Import File" => Ok(Command::ImportFile),
            b"Export File" => Ok(Command::ExportFile),
            b"GetProcessID" => Ok(Command::GetProcessId),
            b"Quit" => Ok(Command::Quit),
            other => Err(Error::UnknownCommand(String::from_utf8_lossy(other).into_owned())),
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Command::Relax => "Relax",
            Command::Simulate => "Simulate",
            Command::AbortSimulation => "AbortSimulation",
            Command::ImportFile => "Import File",
            Command::ExportFile => "Export File",
            Command::GetProcessId => "GetProcessID",
            Command::Quit => "Quit",
        }
    }
}

/// Whether the serve loop keeps going after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Builds the frames of an error reply.
pub fn error_frames(marker: String, remap: Vec<u8>, error: &(dyn std::error::Error + 'static)) -> Vec<Frame> {
    vec![
        transport::text(marker),
        remap,
        transport::text(format!("[b]{}[/b]", error_chain(error))),
        transport::text("\n[b]Traceback:[/b]"),
        transport::text(traceback(error)),
    ]
}

/// Renders `error` and its sources on one line, like anyhow's `{:#}`.
pub fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    std::iter::successors(Some(error), |error| error.source())
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ")
}

/// Renders `error` and its sources the way anyhow prints a report.
fn traceback(error: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let causes: Vec<_> = std::iter::successors(error.source(), |cause| cause.source()).collect();
    if !causes.is_empty() {
        rendered.push_str("\n\nCaused by:");
        for (index, cause) in causes.iter().enumerate() {
            rendered.push_str(&format!("\n    {index}: {cause}"));
        }
    }
    rendered
}

fn decode_i64(frame: &[u8]) -> Result<i64, payload::Error> {
    let mut reader = PayloadReader::new(frame);
    let value = reader.read_i64()?;
    reader.finish()?;
    Ok(value)
}

fn decode_f64(frame: &[u8]) -> Result<f64, payload::Error> {
    let mut reader = PayloadReader::new(frame);
    let value = reader.read_f64()?;
    reader.finish()?;
    Ok(value)
}

/// Header, topology, state and optionally the virtual objects of a request.
struct DecodedSystem {
    force_fields: ForceFieldList,
    header: Header,
    topology: Topology,
    state: StateRecord,
    objects: VirtualObjects,
}

pub struct Dispatcher<C: ControlChannel> {
    channel: C,
    orchestrator: Orchestrator,
    structures: Arc<dyn StructureIo>,
    /// Remap buffer of the topology decoded by the current request.
    remap: Vec<u8>,
}

impl<C: ControlChannel> Dispatcher<C> {
    pub fn new(channel: C, orchestrator: Orchestrator, structures: Arc<dyn StructureIo>) -> Self {
        Self {
            channel,
            orchestrator,
            structures,
            remap: Vec::new(),
        }
    }

    /// Serves requests until a Quit command or a transport failure.
    pub fn serve(&mut self) -> Result<(), transport::Error> {
        loop {
            if self.handle_next()? == Flow::Quit {
                log::info!("Worker shutting down");
                return Ok(());
            }
        }
    }

    /// Reads one request and sends its reply.
    pub fn handle_next(&mut self) -> Result<Flow, transport::Error> {
        let tag = self.channel.recv()?;
        self.remap.clear();
        match self.dispatch(&tag) {
            Ok((reply, flow)) => {
                self.channel.send(reply)?;
                Ok(flow)
            }
            Err(err) => {
                log::error!("{err:#}");
                self.discard_unread();
                let frames = error_frames(ERROR_MARKER.to_string(), std::mem::take(&mut self.remap), &*err);
                self.channel.send(frames)?;
                Ok(Flow::Continue)
            }
        }
    }

    fn discard_unread(&mut self) {
        while self.channel.has_more() {
            match self.channel.recv() {
                Ok(frame) => log::error!("DISCARDED BYTES ON ERROR: {}", String::from_utf8_lossy(&frame)),
                Err(err) => {
                    log::error!("Failed to discard unread frames: {err}");
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, tag: &[u8]) -> anyhow::Result<(Vec<Frame>, Flow)> {
        let command = Command::from_tag(tag)?;
        log::info!("Server received a {} request", command.tag());
        let reply = match command {
            Command::Relax => self.relax()?,
            Command::Simulate => self.simulate()?,
            Command::AbortSimulation => self.abort()?,
            Command::ImportFile => self.import_file()?,
            Command::ExportFile => self.export_file()?,
            Command::GetProcessId => vec![u64::from(std::process::id()).to_le_bytes().to_vec()],
            Command::Quit => {
                let cancelled = self.orchestrator.registry().cancel_all();
                log::info!("Cancelled {cancelled} running simulations");
                return Ok((vec![transport::text(ACK)], Flow::Quit));
            }
        };
        Ok((reply, Flow::Continue))
    }

    fn next_frame(&mut self, what: &str) -> anyhow::Result<Frame> {
        if !self.channel.has_more() {
            return Err(anyhow!("request ended before the {what} frame"));
        }
        Ok(self.channel.recv()?)
    }

    fn next_text(&mut self, what: &'static str) -> anyhow::Result<String> {
        let frame = self.next_frame(what)?;
        String::from_utf8(frame).map_err(|_| Error::InvalidText(what).into())
    }

    fn read_system(&mut self, with_objects: bool) -> anyhow::Result<DecodedSystem> {
        let force_fields = ForceFieldList::parse(&self.next_text("force-field list")?)?;

        let frame = self.next_frame("header")?;
        let header = Header::decode(&frame).context("failed to decode header")?;
        log::info!("Header: atoms_count={}, bonds_count={}", header.atoms_count, header.bonds_count);

        let frame = self.next_frame("topology")?;
        let record = TopologyRecord::decode(&frame, &header).context("failed to decode topology")?;
        let topology = Topology::from_records(&header, &record).context("failed to build topology")?;
        self.remap = topology.index_map().remap_buffer();

        let frame = self.next_frame("state")?;
        let state = StateRecord::decode(&frame, header.state_len()).context("failed to decode state")?;

        let mut objects = VirtualObjects::default();
        if with_objects {
            for index in 0..header.virtual_objects_count {
                let document = self.next_text("virtual object")?;
                objects
                    .add_document(&document)
                    .with_context(|| format!("failed to read virtual object #{index}"))?;
            }
        }

        Ok(DecodedSystem {
            force_fields,
            header,
            topology,
            state,
            objects,
        })
    }

    fn relax(&mut self) -> anyhow::Result<Vec<Frame>> {
        let temperature = decode_f64(&self.next_frame("temperature")?).context("failed to decode temperature")?;
        let system = self.read_system(true)?;
        let request = RelaxRequest {
            temperature,
            force_fields: system.force_fields,
            header: system.header,
            topology: system.topology,
            state: system.state,
            objects: system.objects,
        };
        let positions = self.orchestrator.relax(&request).context("relaxation failed")?;
        Ok(vec![payload::encode_positions(&positions)])
    }

    fn simulate(&mut self) -> anyhow::Result<Vec<Frame>> {
        let id = decode_i64(&self.next_frame("simulation id")?).context("failed to decode simulation id")?;
        let frame = self.next_frame("simulation parameters")?;
        let parameters = SimulationParameters::decode(&frame).context("failed to decode simulation parameters")?;
        let system = self.read_system(true)?;

        let token = self.orchestrator.register(id)?;
        self.orchestrator.spawn(
            SimulationRequest {
                id,
                parameters,
                force_fields: system.force_fields,
                header: system.header,
                topology: system.topology,
                state: system.state,
                objects: system.objects,
            },
            token,
        );
        Ok(vec![transport::text(RUNNING)])
    }

    fn abort(&mut self) -> anyhow::Result<Vec<Frame>> {
        let id = decode_i64(&self.next_frame("simulation id")?).context("failed to decode simulation id")?;
        if self.orchestrator.registry().cancel(id) {
            log::info!("Aborting simulation {id}");
        } else {
            log::info!("No running simulation with id {id}");
        }
        Ok(vec![transport::text(ACK)])
    }

    fn import_file(&mut self) -> anyhow::Result<Vec<Frame>> {
        let mut request = ImportRequest::new(self.next_text("path")?);
        while self.channel.has_more() {
            let option = self.next_text("option")?;
            request.apply_option(&option);
        }
        let structure = self
            .structures
            .import(&request)
            .with_context(|| format!("failed to import {}", request.path.display()))?;
        Ok(structure.to_frames())
    }

    fn export_file(&mut self) -> anyhow::Result<Vec<Frame>> {
        let path = PathBuf::from(self.next_text("path")?);
        let system = self.read_system(false)?;
        log::debug!("Export force fields: {:?}", system.force_fields);
        self.structures
            .export(&path, &system.topology, &system.state)
            .with_context(|| format!("failed to export {}", path.display()))?;
        Ok(vec![transport::text(SUCCESS)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ElementForceField, NativeBackend, ReferenceBackend};
    use crate::payload::records::tests::{water_header, water_topology};
    use crate::simulation::{Collaborators, SimulationRegistry};
    use crate::structure::PdbStructureIo;
    use crate::topology::FormalChargeModel;
    use crate::transport::memory::{MemoryClient, control_pair};
    use crate::transport::MemoryPublisher;
    use std::thread::JoinHandle;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn start() -> (MemoryClient, Arc<MemoryPublisher>, JoinHandle<Result<(), transport::Error>>) {
        let (channel, client) = control_pair();
        let publisher = Arc::new(MemoryPublisher::new());
        let collaborators = Collaborators {
            charges: Arc::new(FormalChargeModel),
            force_field: Arc::new(ElementForceField::new("offxml", "offxml_extensions")),
            backends: vec![Arc::new(NativeBackend), Arc::new(ReferenceBackend::new(Some(3)))],
            lock_stiffness: 500_000.0,
            relax_max_iterations: 200,
            emitter_seed: Some(1),
        };
        let orchestrator = Orchestrator::new(Arc::new(SimulationRegistry::new()), publisher.clone(), collaborators, 2).unwrap();
        let mut dispatcher = Dispatcher::new(channel, orchestrator, Arc::new(PdbStructureIo));
        let handle = std::thread::spawn(move || dispatcher.serve());
        (client, publisher, handle)
    }

    fn request(client: &MemoryClient, frames: Vec<Frame>) -> Vec<Frame> {
        client.send(frames).unwrap();
        client.recv(TIMEOUT).unwrap()
    }

    fn water_frames() -> Vec<Frame> {
        let state = StateRecord {
            positions: vec![[0.0, 0.0, 0.0], [0.097, 0.0, 0.0], [0.0, 0.097, 0.0]],
        };
        vec![
            transport::text("base.offxml"),
            water_header().encode(),
            water_topology().encode(),
            state.encode(),
        ]
    }

    fn simulate_frames(id: i64, total_step_count: u32) -> Vec<Frame> {
        let parameters = SimulationParameters {
            temperature_in_kelvins: 300.0,
            time_step_in_femtoseconds: 0.5,
            steps_per_report: 1,
            total_step_count,
        };
        let mut frames = vec![transport::text("Simulate"), id.to_le_bytes().to_vec(), parameters.encode()];
        frames.extend(water_frames());
        frames
    }

    fn quit(client: &MemoryClient, handle: JoinHandle<Result<(), transport::Error>>) {
        assert_eq!(request(client, vec![transport::text("Quit")]), vec![b"ack".to_vec()]);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn tags_map_to_commands() {
        assert_eq!(Command::from_tag(b"Import File").unwrap(), Command::ImportFile);
        assert_eq!(Command::from_tag(b"GetProcessID").unwrap().tag(), "GetProcessID");
        assert!(matches!(Command::from_tag(b"Explode"), Err(Error::UnknownCommand(tag)) if tag == "Explode"));
    }

    #[test]
    fn traceback_lists_causes() {
        let err = anyhow!("inner").context("middle").context("outer");
        let frames = error_frames("err".to_string(), Vec::new(), &*err);
        assert_eq!(frames[2], b"[b]outer: middle: inner[/b]".to_vec());
        assert_eq!(frames[3], b"\n[b]Traceback:[/b]".to_vec());
        assert_eq!(String::from_utf8(frames[4].clone()).unwrap(), "outer\n\nCaused by:\n    0: middle\n    1: inner");
    }

    #[test]
    fn process_id_is_u64() {
        let (client, _publisher, handle) = start();
        let reply = request(&client, vec![transport::text("GetProcessID")]);
        assert_eq!(reply, vec![u64::from(std::process::id()).to_le_bytes().to_vec()]);
        quit(&client, handle);
    }

    #[test]
    fn unknown_command_drains_and_replies_with_error() {
        let (client, _publisher, handle) = start();
        let reply = request(&client, vec![transport::text("Explode"), b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(reply.len(), 5);
        assert_eq!(reply[0], b"err".to_vec());
        assert!(reply[1].is_empty());
        assert_eq!(reply[2], b"[b]unknown command 'Explode'[/b]".to_vec());

        let reply = request(&client, vec![transport::text("GetProcessID")]);
        assert_eq!(reply[0].len(), 8);
        quit(&client, handle);
    }

    #[test]
    fn malformed_state_replies_with_remap() {
        let (client, _publisher, handle) = start();
        let mut frames = simulate_frames(4, 10);
        let state = frames.len() - 1;
        frames[state].truncate(20);
        frames.push(b"trailing".to_vec());

        let reply = request(&client, frames);
        assert_eq!(reply[0], b"err".to_vec());
        // engine index, wire index for each of the three atoms
        assert_eq!(reply[1].len(), 3 * 8);
        let message = String::from_utf8(reply[2].clone()).unwrap();
        assert!(message.contains("failed to decode state"));
        assert!(message.contains("truncated payload"), "{message}");
        quit(&client, handle);
    }

    #[test]
    fn simulate_acknowledges_then_broadcasts() {
        let (client, publisher, handle) = start();
        assert_eq!(request(&client, simulate_frames(11, 3)), vec![b"Running".to_vec()]);

        let messages = publisher.wait_for(3, TIMEOUT);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0][0], b"11".to_vec());
        assert_eq!(messages[2][1], 3.0f64.to_le_bytes().to_vec());

        let mut abort = vec![transport::text("AbortSimulation")];
        abort.push(11i64.to_le_bytes().to_vec());
        assert_eq!(request(&client, abort), vec![b"ack".to_vec()]);
        quit(&client, handle);
    }

    #[test]
    fn duplicate_live_id_is_rejected() {
        let (client, _publisher, handle) = start();
        assert_eq!(request(&client, simulate_frames(21, u32::MAX)), vec![b"Running".to_vec()]);
        let reply = request(&client, simulate_frames(21, 10));
        assert_eq!(reply[0], b"err".to_vec());
        assert_eq!(reply[1].len(), 3 * 8);
        quit(&client, handle);
    }

    #[test]
    fn relax_returns_explicit_positions() {
        let (client, _publisher, handle) = start();
        let mut frames = vec![transport::text("Relax"), 300.0f64.to_le_bytes().to_vec()];
        frames.extend(water_frames());
        let reply = request(&client, frames);
        assert_eq!(reply.len(), 1);
        assert_eq!(reply[0].len(), 3 * 24);
        quit(&client, handle);
    }

    #[test]
    fn export_then_import_through_commands() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("water.pdb");
        let path_text = path.to_str().unwrap().to_string();
        let (client, _publisher, handle) = start();

        let mut frames = vec![transport::text("Export File"), transport::text(&path_text)];
        frames.extend(water_frames());
        assert_eq!(request(&client, frames), vec![b"SUCCESS".to_vec()]);

        let reply = request(
            &client,
            vec![
                transport::text("Import File"),
                transport::text(&path_text),
                transport::text("--remove_waters=no"),
                transport::text("--unknown=yes"),
            ],
        );
        assert_eq!(reply.len(), 3);
        assert_eq!(reply[0], vec![8, 1, 1]);
        assert_eq!(reply[1].len(), 3 * 24);
        assert_eq!(reply[2].len(), 2 * 9);
        quit(&client, handle);
    }

    #[test]
    fn import_of_unsupported_format_is_an_error() {
        let (client, _publisher, handle) = start();
        let reply = request(&client, vec![transport::text("Import File"), transport::text("model.xyz")]);
        assert_eq!(reply[0], b"err".to_vec());
        assert!(String::from_utf8(reply[4].clone()).unwrap().contains("unsupported structure format 'xyz'"));
        quit(&client, handle);
    }
}
