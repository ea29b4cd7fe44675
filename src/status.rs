//! The HTTP/1.0 status page: a read-only view of the engine's counters.
//! Rendering a page consumes (and resets) the byte/jitter window, same as
//! the reference implementation's webserver thread.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::Arc;

use crate::engine::{Engine, EngineState, StatusSnapshot};

const READ_BUF: usize = 2048;

pub fn run(listener: TcpListener, engine: Arc<Engine>, hl2_iface: String, wifi_iface: String, hl2_addr: Ipv4Addr, wifi_addr: Ipv4Addr) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => handle(stream, &engine, &hl2_iface, &wifi_iface, hl2_addr, wifi_addr),
            Err(err) => log::warn!("status listener accept failed: {err}"),
        }
    }
}

fn handle(mut stream: TcpStream, engine: &Engine, hl2_iface: &str, wifi_iface: &str, hl2_addr: Ipv4Addr, wifi_addr: Ipv4Addr) {
    let mut buf = [0u8; READ_BUF];
    let n = match stream.read(&mut buf) {
        Ok(n) => n,
        Err(err) => {
            log::warn!("status connection read failed: {err}");
            return;
        }
    };
    let request = String::from_utf8_lossy(&buf[..n]);
    if request.contains("favicon.ico") {
        let _ = stream.shutdown(std::net::Shutdown::Both);
        return;
    }

    let snapshot = engine.snapshot();
    let page = render(&snapshot, hl2_iface, wifi_iface, hl2_addr, wifi_addr);
    if let Err(err) = stream.write_all(page.as_bytes()) {
        log::warn!("status connection write failed: {err}");
    }
}

fn render(
    snapshot: &StatusSnapshot,
    hl2_iface: &str,
    wifi_iface: &str,
    hl2_addr: Ipv4Addr,
    wifi_addr: Ipv4Addr,
) -> String {
    let elapsed_secs = snapshot.window_elapsed.as_secs_f64().max(f64::MIN_POSITIVE);
    let rate_up_mbit = (snapshot.up_bytes as f64 * 8.0) / elapsed_secs / 1_000_000.0;
    let rate_down_mbit = (snapshot.down_bytes as f64 * 8.0) / elapsed_secs / 1_000_000.0;
    let jitter_secs = snapshot.jitter.as_secs_f64();

    let mut body = String::new();
    body.push_str(
        "HTTP/1.0 200 OK\r\n\
         Server: hl2-wifi-buffer\r\n\
         Content-type: text/html\r\n\r\n\
         <html>\r\n<head>\r\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\r\n\
         <meta http-equiv=\"refresh\" content=\"3\">\r\n\
         <title>Hermes-Lite2 WiFi Buffer</title>\r\n\
         </head>\r\n\
         <style>table, th, td { border: 1px solid black; }</style>\r\n\
         <body>\r\n",
    );
    body.push_str("<h4>Hermes-Lite2 WiFi Buffer</h4>\r\n");

    body.push_str(&format!(
        "<b>Hermes Lite</b><br>\r\nHL2 Interface {hl2_iface}<br>\r\nInterface address {hl2_addr}<br>\r\n\
         Internal buffer faults {}<br><br>\r\n",
        snapshot.hl2_buffer_faults
    ));

    body.push_str(&format!(
        "<b>WiFi</b><br>\r\nWiFi Interface {wifi_iface}<br>\r\nWiFi Address {wifi_addr}<br>\r\n\
         Rate up {rate_up_mbit:.1} Mbits/sec<br>\r\nRate down {rate_down_mbit:.1} Mbits/sec<br>\r\n\
         Jitter {jitter_secs:.3} seconds<br><br>\r\n"
    ));

    if snapshot.used > 0 {
        body.push_str(&format!(
            "<b>WiFi Sequence Errors:</b><br>\r\n\
             Out of order {}<br>\r\nMissing {}<br>\r\nDuplicate {}<br>\r\nToo late - lost {}<br><br>\r\n",
            snapshot.seq_out_of_order, snapshot.seq_missing, snapshot.seq_duplicate, snapshot.seq_too_late
        ));
        let level = f64::from(snapshot.fill) / f64::from(snapshot.used) * 100.0;
        body.push_str(&format!(
            "<b>WiFi Buffer</b><br>\r\nState {}<br>\r\nLevel {level:.1}%<br>\r\n\
             Underflows {}<br>\r\nOverflows {}<br><br>\r\n",
            state_label(snapshot.state),
            snapshot.buffer_underflow,
            snapshot.buffer_overflow
        ));
    } else {
        body.push_str("<b>WiFi Sequence Errors:</b><br>\r\nBuffer not in use<br><br>\r\n");
    }

    body.push_str("</body>\r\n</html>\r\n");
    body
}

fn state_label(state: EngineState) -> &'static str {
    match state {
        EngineState::Startup => "STARTUP",
        EngineState::Normal => "NORMAL",
        EngineState::Restarting => "RESTARTING",
    }
}
