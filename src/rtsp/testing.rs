//! Local RTSP server for tests, served by gst-rtsp-server.

use gst::glib;
use gst_rtsp_server::prelude::*;
use std::thread::JoinHandle;
use std::time::Duration;

/// 25 fps of small JPEG frames.
const LAUNCH: &str = "( videotestsrc is-live=true \
    ! video/x-raw,width=160,height=120,framerate=25/1 \
    ! jpegenc ! rtpjpegpay name=pay0 pt=26 )";

/// Elements the client and this server need.
const ELEMENTS: &[&str] = &[
    "rtspsrc",
    "appsink",
    "fakesink",
    "videotestsrc",
    "jpegenc",
    "rtpjpegpay",
];

/// Whether GStreamer and the plugins used here are installed.
pub fn media_available() -> bool {
    super::init().is_ok() && ELEMENTS.iter().all(|name| gst::ElementFactory::find(name).is_some())
}

/// A server on 127.0.0.1 with one mount at `/live`. Stops when dropped.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    main_loop: glib::MainLoop,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Start a server, or `None` when the plugins are missing.
    pub fn start() -> Option<Self> {
        if !media_available() {
            eprintln!("skipping: GStreamer RTSP plugins not installed");
            return None;
        }

        let server = gst_rtsp_server::RTSPServer::new();
        server.set_address("127.0.0.1");
        server.set_service("0");

        let factory = gst_rtsp_server::RTSPMediaFactory::new();
        factory.set_launch(LAUNCH);
        factory.set_shared(true);
        factory.set_protocols(gst_rtsp::RTSPLowerTrans::TCP | gst_rtsp::RTSPLowerTrans::UDP);
        server.mount_points()?.add_factory("/live", factory);

        let context = glib::MainContext::new();
        server.attach(Some(&context)).ok()?;
        let port = u16::try_from(server.bound_port()).ok()?;

        let main_loop = glib::MainLoop::new(Some(&context), false);
        let runner = main_loop.clone();
        let thread = std::thread::spawn(move || {
            // Keeps the server alive for as long as the loop runs
            let _server = server;
            let _ = context.with_thread_default(|| runner.run());
        });
        for _ in 0..200 {
            if main_loop.is_running() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        Some(Self {
            url: format!("rtsp://127.0.0.1:{}/live", port),
            port,
            main_loop,
            thread: Some(thread),
        })
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.main_loop.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
