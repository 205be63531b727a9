//! Simulated Transport
//!
//! Virtual cubes driving circles on a play mat. Each connected cube gets its
//! own OS thread that emits position notifications, so the notification
//! path crosses a thread boundary exactly like a real BLE backend.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use super::{
    DeviceDescriptor, DeviceHandle, DeviceTransport, LedColor, Notification, NotificationHandler,
    Position, TransportError,
};

/// Mat center and radius of the simulated path, in mat units
const MAT_CENTER: (f64, f64) = (250.0, 250.0);
const PATH_RADIUS: f64 = 80.0;

/// Every Nth tick the cube briefly loses sight of the mat
const MISSED_EVERY: u64 = 40;

/// One virtual cube
#[derive(Debug, Clone)]
pub struct SimulatedCube {
    pub id: String,
    pub battery_level: u8,
}

impl SimulatedCube {
    pub fn new(id: impl Into<String>, battery_level: u8) -> Self {
        Self {
            id: id.into(),
            battery_level,
        }
    }
}

/// A live simulated link
struct Link {
    running: Arc<AtomicBool>,
    /// Degrees per tick, derived from the last motor command
    speed: Arc<Mutex<f64>>,
}

/// Transport backed by virtual cubes
pub struct SimulatedTransport {
    cubes: HashMap<String, SimulatedCube>,
    tick: Duration,
    links: Mutex<HashMap<String, Link>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimulatedTransport {
    pub fn new(cubes: Vec<SimulatedCube>, tick: Duration) -> Self {
        Self {
            cubes: cubes.into_iter().map(|c| (c.id.clone(), c)).collect(),
            tick,
            links: Mutex::new(HashMap::new()),
        }
    }

    fn cube_for(&self, handle: &DeviceHandle) -> Result<&SimulatedCube, TransportError> {
        if !lock(&self.links).contains_key(&handle.address) {
            return Err(TransportError::Closed);
        }
        self.cubes
            .get(&handle.address)
            .ok_or_else(|| TransportError::NotFound(handle.address.clone()))
    }
}

#[async_trait]
impl DeviceTransport for SimulatedTransport {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn scan(&self, target_ids: &[String]) -> Result<Vec<DeviceDescriptor>, TransportError> {
        Ok(target_ids
            .iter()
            .filter_map(|id| self.cubes.get(id))
            .map(|cube| DeviceDescriptor {
                target_id: cube.id.clone(),
                name: format!("toio Core Cube-{}", cube.id),
                address: cube.id.clone(),
            })
            .collect())
    }

    async fn connect(&self, descriptor: &DeviceDescriptor) -> Result<DeviceHandle, TransportError> {
        if !self.cubes.contains_key(&descriptor.address) {
            return Err(TransportError::NotFound(descriptor.address.clone()));
        }

        let mut links = lock(&self.links);
        if links.contains_key(&descriptor.address) {
            return Err(TransportError::ConnectFailed(format!(
                "{} is already linked",
                descriptor.address
            )));
        }
        links.insert(
            descriptor.address.clone(),
            Link {
                running: Arc::new(AtomicBool::new(true)),
                speed: Arc::new(Mutex::new(4.0)),
            },
        );

        tracing::debug!(address = %descriptor.address, "Simulated link up");
        Ok(DeviceHandle {
            address: descriptor.address.clone(),
            name: descriptor.name.clone(),
        })
    }

    async fn disconnect(&self, handle: &DeviceHandle) -> Result<bool, TransportError> {
        match lock(&self.links).remove(&handle.address) {
            Some(link) => {
                link.running.store(false, Ordering::SeqCst);
                tracing::debug!(address = %handle.address, "Simulated link down");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn read_battery(&self, handle: &DeviceHandle) -> Result<u8, TransportError> {
        Ok(self.cube_for(handle)?.battery_level)
    }

    async fn set_motor(
        &self,
        handle: &DeviceHandle,
        left: i64,
        right: i64,
    ) -> Result<(), TransportError> {
        self.cube_for(handle)?;
        if let Some(link) = lock(&self.links).get(&handle.address) {
            // Average wheel speed sets how fast the cube travels along the path
            *lock(&link.speed) = left.saturating_add(right) as f64 / 20.0;
        }
        tracing::trace!(address = %handle.address, left, right, "Simulated motor");
        Ok(())
    }

    async fn set_led(&self, handle: &DeviceHandle, color: LedColor) -> Result<(), TransportError> {
        self.cube_for(handle)?;
        tracing::trace!(
            address = %handle.address,
            r = color.r,
            g = color.g,
            b = color.b,
            "Simulated LED"
        );
        Ok(())
    }

    async fn register_notification_handler(
        &self,
        handle: &DeviceHandle,
        handler: NotificationHandler,
    ) -> Result<(), TransportError> {
        let (running, speed) = {
            let links = lock(&self.links);
            let link = links.get(&handle.address).ok_or(TransportError::Closed)?;
            (Arc::clone(&link.running), Arc::clone(&link.speed))
        };

        let tick = self.tick;
        let address = handle.address.clone();
        thread::Builder::new()
            .name(format!("sim-cube-{}", address))
            .spawn(move || run_cube(running, speed, tick, handler))
            .map_err(|e| TransportError::Io(e.to_string()))?;

        Ok(())
    }
}

/// Ticker loop of one simulated cube
fn run_cube(
    running: Arc<AtomicBool>,
    speed: Arc<Mutex<f64>>,
    tick: Duration,
    handler: NotificationHandler,
) {
    let mut heading: f64 = 0.0;
    let mut ticks: u64 = 0;

    while running.load(Ordering::SeqCst) {
        thread::sleep(tick);
        if !running.load(Ordering::SeqCst) {
            break;
        }
        ticks += 1;

        if ticks % MISSED_EVERY == 0 {
            handler(Notification::Missed);
            continue;
        }

        heading = (heading + *lock(&speed)).rem_euclid(360.0);
        let radians = heading.to_radians();
        let position = Position {
            x: (MAT_CENTER.0 + PATH_RADIUS * radians.cos()).round() as i32,
            y: (MAT_CENTER.1 + PATH_RADIUS * radians.sin()).round() as i32,
            angle: ((heading + 90.0).rem_euclid(360.0)).round() as i32,
        };
        handler(Notification::Position(position));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn transport() -> SimulatedTransport {
        SimulatedTransport::new(
            vec![SimulatedCube::new("A1", 72), SimulatedCube::new("B2", 55)],
            Duration::from_millis(5),
        )
    }

    #[tokio::test]
    async fn test_scan_finds_configured_cubes() {
        let transport = transport();
        let found = transport
            .scan(&["A1".to_string(), "Z9".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].target_id, "A1");
    }

    #[tokio::test]
    async fn test_connect_and_battery() {
        let transport = transport();
        let descriptor = transport.scan(&["B2".to_string()]).await.unwrap().remove(0);
        let handle = transport.connect(&descriptor).await.unwrap();

        assert_eq!(transport.read_battery(&handle).await.unwrap(), 55);
        assert!(transport.connect(&descriptor).await.is_err());

        assert!(transport.disconnect(&handle).await.unwrap());
        assert!(!transport.disconnect(&handle).await.unwrap());
        assert_eq!(
            transport.read_battery(&handle).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn test_notifications_arrive_from_another_thread() {
        let transport = transport();
        let descriptor = transport.scan(&["A1".to_string()]).await.unwrap().remove(0);
        let handle = transport.connect(&descriptor).await.unwrap();

        let (tx, rx) = mpsc::channel();
        let caller = thread::current().id();
        let handler: NotificationHandler = Arc::new(move |notification| {
            let _ = tx.send((thread::current().id(), notification));
        });
        transport
            .register_notification_handler(&handle, handler)
            .await
            .unwrap();

        let (thread_id, notification) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_ne!(thread_id, caller);
        match notification {
            Notification::Position(p) => {
                assert!((150..=350).contains(&p.x));
                assert!((150..=350).contains(&p.y));
            }
            other => panic!("Expected Position, got {:?}", other),
        }

        transport.disconnect(&handle).await.unwrap();
    }
}
