use std::{
    sync::mpsc::{self, RecvTimeoutError},
    thread::JoinHandle,
    time::Duration,
};

use ffmpeg_next::Rational;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    error::IngestError,
    packet::{MonotonicGuard, RawPacket, RemuxStats, TimestampRewrite},
    status::Status,
    stream::AvStream,
};

const WRITER_WAKEUP: Duration = Duration::from_millis(100);

/// An input stream to be copied into the output container.
pub struct RemuxSource {
    /// Which input context the stream lives in.
    pub input: usize,
    pub stream: AvStream,
    /// PTS offset of the stream, in its own time base.
    pub offset: i64,
}

struct Route {
    input: usize,
    in_stream: usize,
    out_stream: usize,
    rewrite: TimestampRewrite,
}

struct WriterContext(ffmpeg_next::format::context::Output);

unsafe impl Send for WriterContext {}

struct OutboundQueue {
    guards: Vec<MonotonicGuard>,
    sender: Option<mpsc::Sender<RawPacket>>,
}

/// Remux session: copies demuxed packets, with corrected timestamps, into one
/// output container written by a dedicated thread.
pub struct MediaOutput {
    path: String,
    routes: Vec<Route>,
    out_time_bases: Vec<Rational>,
    queue: Mutex<OutboundQueue>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl MediaOutput {
    pub fn open(path: &str, sources: &[RemuxSource], status: &Status) -> anyhow::Result<Self> {
        if !sources.iter().any(|source| source.stream.is_video()) {
            return Err(IngestError::open("output needs a video stream"));
        }
        let mut output = ffmpeg_next::format::output(path)
            .map_err(|e| IngestError::open(format!("cannot create output {}: {}", path, e)))?;

        let mut routes = Vec::with_capacity(sources.len());
        for source in sources {
            let mut parameters = source.stream.parameters().clone();
            unsafe {
                (*parameters.as_mut_ptr()).codec_tag = 0;
            }
            let mut writer_stream = output
                .add_stream(ffmpeg_next::encoder::find(parameters.id()))
                .map_err(|e| IngestError::open(format!("cannot add output stream: {}", e)))?;
            writer_stream.set_parameters(parameters);
            writer_stream.set_time_base(source.stream.time_base());
            routes.push((source, writer_stream.index()));
        }

        output
            .write_header()
            .map_err(|e| IngestError::open(format!("cannot write header of {}: {}", path, e)))?;

        let out_time_bases: Vec<Rational> = output.streams().map(|s| s.time_base()).collect();
        let routes: Vec<Route> = routes
            .into_iter()
            .map(|(source, out_stream)| Route {
                input: source.input,
                in_stream: source.stream.index(),
                out_stream,
                rewrite: TimestampRewrite::new(
                    source.offset,
                    source.stream.time_base(),
                    out_time_bases[out_stream],
                ),
            })
            .collect();
        for route in &routes {
            log::info!(
                "remux input {} stream #{} -> {} stream #{} ({})",
                route.input,
                route.in_stream,
                path,
                route.out_stream,
                out_time_bases[route.out_stream]
            );
        }

        let (sender, receiver) = mpsc::channel();
        let stop = status.child_token();
        let writer_status = status.clone();
        let writer_path = path.to_string();
        let context = WriterContext(output);
        let handle = std::thread::Builder::new()
            .name("remux-writer".into())
            .spawn(move || {
                if let Err(e) = writer_loop(context, receiver, &writer_status, stop, &writer_path) {
                    log::error!("remux writer for {} failed: {:#}", writer_path, e);
                    writer_status.set_emergency();
                }
            })?;

        Ok(Self {
            path: path.to_string(),
            routes,
            queue: Mutex::new(OutboundQueue {
                guards: out_time_bases.iter().map(|_| MonotonicGuard::default()).collect(),
                sender: Some(sender),
            }),
            out_time_bases,
            writer: Mutex::new(Some(handle)),
        })
    }

    fn route(&self, input: usize, stream: usize) -> Option<&Route> {
        self.routes
            .iter()
            .find(|route| route.input == input && route.in_stream == stream)
    }

    /// Rewrites and queues a packet demuxed from `input`. Returns whether it
    /// was accepted; packets of unrouted streams are ignored.
    pub fn enqueue(&self, input: usize, packet: &RawPacket) -> bool {
        let Some(route) = self.route(input, packet.index()) else {
            return false;
        };
        let Some((pts, dts)) = route.rewrite.apply(packet.pts(), packet.dts()) else {
            log::warn!(
                "packet on input {} stream #{} has no timestamps, dropped",
                input,
                route.in_stream
            );
            return false;
        };
        let mut queue = self.queue.lock();
        let OutboundQueue { guards, sender } = &mut *queue;
        let guard = &mut guards[route.out_stream];
        if !guard.allows(pts, dts) {
            guard.record_dropped();
            log::error!(
                "packet lost: output stream #{} pts {} dts {} is not after the previous packet",
                route.out_stream,
                pts,
                dts
            );
            return false;
        }
        let outbound = packet.for_output(
            route.out_stream,
            pts,
            dts,
            self.out_time_bases[route.out_stream],
        );
        let sent = sender
            .as_ref()
            .is_some_and(|sender| sender.send(outbound).is_ok());
        if sent {
            guard.record_accepted(pts, dts);
        } else {
            guard.record_dropped();
            log::error!(
                "packet lost: remux writer for output stream #{} is gone",
                route.out_stream
            );
        }
        sent
    }

    /// Accepted/dropped counts per output stream, by output stream index.
    pub fn stats(&self) -> Vec<RemuxStats> {
        self.queue.lock().guards.iter().map(|g| g.stats()).collect()
    }

    /// Lets the writer drain the queue, write the trailer and exit.
    pub fn close(&self) {
        self.queue.lock().sender.take();
        if let Some(handle) = self.writer.lock().take() {
            if handle.join().is_err() {
                log::error!("remux writer for {} panicked", self.path);
            }
        }
    }
}

impl Drop for MediaOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn writer_loop(
    mut context: WriterContext,
    receiver: mpsc::Receiver<RawPacket>,
    status: &Status,
    stop: CancellationToken,
    path: &str,
) -> anyhow::Result<()> {
    let mut written = 0u64;
    loop {
        if stop.is_cancelled() {
            break;
        }
        match receiver.recv_timeout(WRITER_WAKEUP) {
            Ok(packet) => {
                packet.packet().write_interleaved(&mut context.0)?;
                written += 1;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let lost = receiver.try_iter().count();
    if lost > 0 {
        log::error!(
            "{} packets were never written to {} (emergency stop)",
            lost,
            path
        );
    }
    context.0.write_trailer()?;
    log::info!("remux finished: {} packets written to {}", written, path);
    if status.is_emergency() {
        log::warn!("{} was closed during an emergency stop and may be truncated", path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_requires_video() {
        let status = Status::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.nut");
        let err = match MediaOutput::open(&path.to_string_lossy(), &[], &status) {
            Ok(_) => panic!("open without streams should fail"),
            Err(err) => err,
        };
        assert!(matches!(IngestError::of(&err), Some(IngestError::Open(_))));
    }
}
