//! Integration tests for the simulated instrument.

use scanbot_core::capabilities::{
    DataDirection, FollowMe, ScanAction, ScanControl, ScanDirection, TipShaper,
};
use scanbot_core::frame::{Point, ScanFrame};
use scanbot_core::limits::DEFAULT_CHANNEL;
use scanbot_driver_mock::{Feature, SimulatedInstrument, Surface};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_upward_scan_is_recorded_bottom_first() {
    // a bump near the top edge of the frame
    let surface = Surface::flat().with_feature(Feature::new(Point::new(0.0, 4e-9), 0.5e-9, 1e-9));
    let instrument = SimulatedInstrument::builder().surface(surface).buffer(32, 32).build();

    instrument.scan_action(ScanAction::Start, ScanDirection::Up).await.unwrap();
    let wait = instrument.wait_end_of_scan(Duration::from_secs(10)).await.unwrap();
    assert!(wait.completed());

    let raw = instrument.frame_data_grab(DEFAULT_CHANNEL, DataDirection::Forward).await.unwrap();
    let top_of_raw: f64 = raw.row(1).iter().sum();
    let bottom_of_raw: f64 = raw.row(30).iter().sum();
    assert!(bottom_of_raw > top_of_raw);
}

#[tokio::test(start_paused = true)]
async fn test_imprint_visible_in_next_scan() {
    let instrument = SimulatedInstrument::builder().imprint_shape(1e-9, 1e-9).build();
    let frame = ScanFrame::square(Point::default(), 10e-9).unwrap();
    instrument.scan_frame_set(&frame).await.unwrap();
    instrument.folme_xy_set(Point::default(), true).await.unwrap();
    instrument.tip_shaper_start(true, Duration::from_secs(30)).await.unwrap();

    instrument.scan_action(ScanAction::Start, ScanDirection::Down).await.unwrap();
    instrument.wait_end_of_scan(Duration::from_secs(10)).await.unwrap();
    let image = instrument.frame_data_grab(DEFAULT_CHANNEL, DataDirection::Forward).await.unwrap();
    assert!(image[[32, 32]] < 0.0);
    assert_eq!(image[[0, 0]], 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_rejects_frame_outside_range() {
    let instrument = SimulatedInstrument::new();
    let frame = ScanFrame::square(Point::new(0.6e-6, 0.0), 10e-9).unwrap();
    assert!(instrument.scan_frame_set(&frame).await.is_err());
}
