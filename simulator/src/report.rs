use chrono::{Local, Timelike};
use rand::Rng;
use serde::Serialize;

/// Payload an ESP32 room controller publishes on `esp/{room_id}/report`.
#[derive(Debug, Clone, Serialize)]
pub struct RoomReport {
    pub temp: f64,
    pub hum: f64,
    pub ldr: u32,
    pub pir: &'static str,
    pub mq2: u32,
}

/// Slowly drifting readings for one simulated room.
pub struct RoomSensors {
    temp: f64,
    hum: f64,
}

impl RoomSensors {
    pub fn new(rng: &mut impl Rng) -> Self {
        Self {
            temp: rng.gen_range(18.0..26.0),
            hum: rng.gen_range(35.0..60.0),
        }
    }

    pub fn sample(&mut self, rng: &mut impl Rng) -> RoomReport {
        self.temp = (self.temp + rng.gen_range(-0.3..0.3)).clamp(5.0, 45.0);
        self.hum = (self.hum + rng.gen_range(-1.0..1.0)).clamp(10.0, 95.0);

        let mq2 = if rng.gen_bool(0.02) {
            rng.gen_range(400..900) // leak
        } else {
            rng.gen_range(80..250)
        };

        RoomReport {
            temp: (self.temp * 10.0).round() / 10.0,
            hum: self.hum.round(),
            ldr: daylight(Local::now().hour(), rng),
            pir: if rng.gen_bool(0.15) { "ON" } else { "OFF" },
            mq2,
        }
    }
}

fn daylight(hour: u32, rng: &mut impl Rng) -> u32 {
    let base = match hour {
        7..=9 | 17..=19 => 1500,
        10..=16 => 3200,
        _ => 150,
    };
    base + rng.gen_range(0..200)
}
