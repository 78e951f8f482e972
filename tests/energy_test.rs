//! Integration tests for the energy/threshold coordinator.

use mx_daq::config::EnergyConfig;
use mx_daq::error::DaqError;
use mx_daq::events::{BeamlineEvent, EventBus};
use mx_daq::hardware::mock::{MockAxis, MockThreshold};
use mx_daq::procedures::energy::{
    energy_to_theta, energy_to_wavelength, theta_to_energy, EnergyCoordinator,
};
use std::sync::Arc;
use std::time::Duration;

const D_SPACING: f64 = 6.2712;

fn coordinator() -> (EnergyCoordinator, Arc<MockAxis>, Arc<MockThreshold>, EventBus) {
    let angle = Arc::new(MockAxis::new("mono_theta").with_limits(3.0, 30.0).with_motion_polls(3));
    let threshold = Arc::new(MockThreshold::new(6.0));
    let events = EventBus::default();
    let config = EnergyConfig {
        d_spacing: Some(D_SPACING),
        ..EnergyConfig::default()
    };
    let coordinator = EnergyCoordinator::new(&config, angle.clone(), threshold.clone(), events.clone())
        .expect("Failed to build coordinator");
    (coordinator, angle, threshold, events)
}

#[tokio::test(start_paused = true)]
async fn test_round_trip_over_motor_range() {
    let (coordinator, _, _, _) = coordinator();
    let (min, max) = coordinator.energy_limits().await.expect("no energy range");

    let steps = 200;
    for i in 0..=steps {
        let energy = min + (max - min) * f64::from(i) / f64::from(steps);
        let theta = energy_to_theta(energy, D_SPACING).expect("energy in range has no angle");
        assert!((3.0 - 1e-9..=30.0 + 1e-9).contains(&theta));
        let back = theta_to_energy(theta, D_SPACING).expect("angle has no energy");
        assert!((back - energy).abs() < 1e-3, "{energy} -> {theta} -> {back}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_undefined_angle_rejected_before_any_command() {
    let (coordinator, angle, threshold, _) = coordinator();
    let result = coordinator.set_energy(1.9, false).await;
    assert!(matches!(result, Err(DaqError::InvalidTarget(_))));
    assert_eq!(angle.call_count(), 0);
    assert!(threshold.requests().is_empty());
    assert!(!coordinator.is_setting_threshold());
}

#[tokio::test(start_paused = true)]
async fn test_fire_and_forget_reports_settling() {
    let (coordinator, _, _, events) = coordinator();
    let mut rx = events.subscribe();

    coordinator.set_energy(12.4, false).await.expect("set_energy failed");
    assert!(coordinator.is_setting_threshold());
    let request = coordinator.outstanding_request().expect("no request recorded");
    assert!((request.threshold - 6.2).abs() < 1e-9);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(!coordinator.is_setting_threshold());
    coordinator.wait_settled().await.expect("never settled");
    assert!(coordinator.energy_ready().await.expect("ready check failed"));

    let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    assert!(events
        .iter()
        .any(|e| matches!(e, BeamlineEvent::ThresholdChangeRequested { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        BeamlineEvent::EnergyChanged { energy_kev, .. } if (*energy_kev - 12.4).abs() < 1e-12
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, BeamlineEvent::ThresholdSettled { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_requests_are_serialised() {
    let (coordinator, _, threshold, _) = coordinator();
    let coordinator = Arc::new(coordinator);

    let first = coordinator.clone();
    let second = coordinator.clone();
    let (a, b) = tokio::join!(
        async move { first.set_energy(12.4, true).await },
        async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            second.set_energy(9.0, true).await
        },
    );
    a.expect("first change failed");
    b.expect("second change failed");

    let requests = threshold.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].0 - requests[0].0 >= Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_set_wavelength() {
    let (coordinator, _, _, _) = coordinator();
    let wavelength = energy_to_wavelength(12.66).expect("bad energy");
    coordinator
        .set_wavelength(wavelength, true)
        .await
        .expect("set_wavelength failed");
    let current = coordinator.current_wavelength().await.expect("no wavelength");
    assert!((current - wavelength).abs() < 1e-9);
}
