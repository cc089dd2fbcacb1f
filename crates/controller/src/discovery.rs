//! DCP discovery - one Identify-All round over the bound interface

use crate::error::{CoreError, CoreResult};
use crate::transport::L2Transport;
use crate::wire::{DcpIdentifyRequest, DcpIdentifyResponse, MacAddr};
use rand::Rng;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// What one device reported about itself during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    pub station_name: String,
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub vendor_id: u16,
    pub device_id: u16,
}

/// Broadcast an Identify-All request; returns the transaction id the
/// responses will carry
pub fn send_identify(l2: &dyn L2Transport) -> CoreResult<u32> {
    let xid: u32 = rand::thread_rng().gen();
    let request = DcpIdentifyRequest {
        xid,
        response_delay: 255,
    }
    .encode(l2.mac())?;
    info!("dcp identify-all round, xid={:#010X}", xid);
    l2.send_frame(&request)?;
    Ok(xid)
}

/// Broadcast Identify-All and collect responses until `timeout`,
/// reading the socket directly. Only valid while the cyclic receive
/// pump is not running; afterwards the pump owns the socket and
/// discovery collects through `collect_from_channel`.
///
/// Duplicate responses for one station name are collapsed, first one
/// wins. Responses arriving after the window closes are dropped by the
/// kernel with the rest of the socket backlog on the next round.
pub async fn discover(
    l2: Arc<dyn L2Transport>,
    timeout: Duration,
) -> CoreResult<Vec<DeviceReport>> {
    let xid = send_identify(l2.as_ref())?;
    tokio::task::spawn_blocking(move || collect_responses(l2, xid, timeout))
        .await
        .map_err(|e| CoreError::Fatal(format!("discovery task: {e}")))?
}

/// Collect identify responses forwarded by the receive pump
pub async fn collect_from_channel(
    frames: &mut tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
    xid: u32,
    timeout: Duration,
) -> Vec<DeviceReport> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut reports: Vec<DeviceReport> = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        let frame = match tokio::time::timeout(remaining, frames.recv()).await {
            Ok(Some(frame)) => frame,
            _ => break,
        };
        if let Some(report) = report_from_frame(&frame, xid) {
            if !reports.iter().any(|r| r.station_name == report.station_name) {
                reports.push(report);
            }
        }
    }
    info!("discovery round complete: {} device(s)", reports.len());
    reports
}

fn report_from_frame(frame: &[u8], xid: u32) -> Option<DeviceReport> {
    let response = match DcpIdentifyResponse::parse(frame) {
        Ok(Some(response)) => response,
        Ok(None) => return None,
        Err(e) => {
            debug!("dropping malformed identify response: {e}");
            return None;
        }
    };
    if response.xid != xid {
        debug!("stale identify response xid={:#010X}", response.xid);
        return None;
    }
    Some(DeviceReport {
        station_name: response.station_name,
        ip: response.ip,
        mac: response.mac,
        vendor_id: response.vendor_id,
        device_id: response.device_id,
    })
}

fn collect_responses(
    l2: Arc<dyn L2Transport>,
    xid: u32,
    timeout: Duration,
) -> CoreResult<Vec<DeviceReport>> {
    let deadline = Instant::now() + timeout;
    let mut reports: Vec<DeviceReport> = Vec::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let frame = match l2.recv_frame(remaining)? {
            Some(frame) => frame,
            None => break,
        };
        let Some(report) = report_from_frame(&frame, xid) else {
            continue;
        };
        if reports
            .iter()
            .any(|r| r.station_name == report.station_name)
        {
            continue; // first response wins the race
        }
        debug!(
            "identify response: {} at {} ({})",
            report.station_name, report.ip, report.mac
        );
        reports.push(report);
    }

    info!("discovery round complete: {} device(s)", reports.len());
    Ok(reports)
}
