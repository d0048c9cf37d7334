#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use zoo_cutouts::error::FetchError;
use zoo_cutouts::fetch::{HttpTransport, Sleeper};

pub const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];

/// Header plus one row per `(id, ra, petroR90_r, magErr_g, p_el)`; every other
/// column holds a value that passes the default cuts.
pub fn catalog_csv(rows: &[(&str, f64, f64, f64, f64)]) -> String {
    let mut csv = String::from(
        "dr7objid,specobjid,ra,dec,modelMag_u,modelMag_g,modelMag_r,modelMag_i,modelMag_z,\
modelMagErr_u,modelMagErr_g,modelMagErr_r,modelMagErr_i,modelMagErr_z,\
petroR50_r,petroR90_r,p_el_debiased,p_cs_debiased,spiral,elliptical\n",
    );
    for (id, ra, petro, err_g, p_el) in rows {
        csv.push_str(&format!(
            "{id},99,{ra},0.5,19.1,17.9,17.2,16.8,16.5,0.2,{err_g},0.01,0.01,0.03,3.0,{petro},{p_el},0.05,0,1\n"
        ));
    }
    csv
}

/// Replays a fixed sequence of replies, then keeps failing with 503.
pub struct Scripted {
    replies: Mutex<VecDeque<Result<Vec<u8>, FetchError>>>,
    calls: Mutex<u32>,
}

impl Scripted {
    pub fn new(replies: Vec<Result<Vec<u8>, FetchError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

impl HttpTransport for Scripted {
    fn get(&self, _url: &str, _timeout: Duration) -> Result<Vec<u8>, FetchError> {
        *self.calls.lock().unwrap() += 1;
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(FetchError::Status { status: 503 }))
    }
}

#[derive(Default)]
pub struct Recorder(Mutex<Vec<Duration>>);

impl Recorder {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.0.lock().unwrap().clone()
    }

    pub fn total(&self) -> Duration {
        self.sleeps().iter().sum()
    }
}

impl Sleeper for Recorder {
    fn sleep(&self, duration: Duration) {
        self.0.lock().unwrap().push(duration);
    }
}
