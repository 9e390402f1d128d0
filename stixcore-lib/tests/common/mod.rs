use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use stixcore::idb::{Calibration, Idb, Layout, ParameterDef, IDB_FILENAME};
use stixcore::products::table::{Column, Values};
use stixcore::products::{Control, Data, Level, Product, ProductKind, QlProduct};
use stixcore::time::{ScetDelta, ScetTime};

pub const IDB_VERSION: &str = "2.26.34";

/// Encode an unsegmented TM packet.
pub fn packet_bytes(
    sequence_id: u16,
    (service_type, service_subtype): (u8, u8),
    coarse: u32,
    app_data: &[u8],
) -> Vec<u8> {
    let data_len = 10 + app_data.len();
    let mut buf = Vec::with_capacity(6 + data_len);
    buf.extend_from_slice(&(0x0800_u16 | 1460).to_be_bytes());
    buf.extend_from_slice(&((3_u16 << 14) | (sequence_id & 0x3fff)).to_be_bytes());
    buf.extend_from_slice(&((data_len - 1) as u16).to_be_bytes());
    buf.extend_from_slice(&[0x10, service_type, service_subtype, 0]);
    buf.extend_from_slice(&coarse.to_be_bytes());
    buf.extend_from_slice(&0_u16.to_be_bytes());
    buf.extend_from_slice(app_data);
    buf
}

fn param(nix: &str, name: &str, bits: u8, count: usize) -> ParameterDef {
    ParameterDef {
        nix: nix.to_string(),
        name: name.to_string(),
        bits,
        count,
        curtx: None,
        unit: None,
    }
}

/// Write an IDB for housekeeping mini reports and quicklook lightcurves below `root`.
pub fn write_idb(root: &Path) -> PathBuf {
    let mut hk_temp = param("NIX00078", "hk_temp", 16, 1);
    hk_temp.curtx = Some("CIX00001TM".to_string());
    hk_temp.unit = Some("degC".to_string());
    let idb = Idb {
        version: IDB_VERSION.to_string(),
        layouts: vec![
            Layout {
                service_type: 3,
                service_subtype: 25,
                ssid: Some(1),
                parameters: vec![param("NIXD0001", "ssid", 8, 1), hk_temp],
            },
            Layout {
                service_type: 21,
                service_subtype: 6,
                ssid: Some(30),
                parameters: vec![
                    param("NIXD0001", "ssid", 8, 1),
                    param("NIX00405", "integration_time", 8, 1),
                    param("NIX00270", "num_samples", 8, 1),
                    param("NIX00272", "counts", 8, 4),
                ],
            },
        ],
        calibrations: BTreeMap::from([(
            "CIX00001TM".to_string(),
            Calibration::Polynomial {
                coeffs: vec![-10.0, 0.5],
            },
        )]),
        compression: BTreeMap::new(),
    };
    let dir = root.join(format!("v{IDB_VERSION}"));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(IDB_FILENAME), serde_json::to_vec(&idb).unwrap()).unwrap();
    root.to_path_buf()
}

/// A lightcurve product with one Control row per distinct value in `refs`.
pub fn lightcurve(level: Level, times: &[f64], refs: &[usize], counts: &[u32]) -> Product {
    let n = refs.iter().max().map_or(0, |m| m + 1);
    let first = times.first().copied().unwrap_or_default() as u32;
    let mut control = Control {
        scet_coarse: vec![first; n],
        index: (0..n).collect(),
        ..Default::default()
    };
    control.fill_missing();
    let data = Data {
        time: times.iter().map(|t| ScetTime::from_float(*t)).collect(),
        timedel: vec![ScetDelta::from_seconds(0.5); times.len()],
        control_index: refs.to_vec(),
        columns: vec![Column::new("counts", Values::U32(counts.to_vec()))].into(),
    };
    Product::builder()
        .kind(ProductKind::QuickLook(QlProduct::LightCurve))
        .level(level)
        .service_type(21)
        .service_subtype(6)
        .ssid(Some(30))
        .control(control)
        .data(data)
        .build()
}

pub fn times(p: &Product) -> Vec<f64> {
    p.data.time.iter().map(ScetTime::as_float).collect()
}
