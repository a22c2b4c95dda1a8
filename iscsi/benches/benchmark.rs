use std::collections::BTreeMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use iscsi_initiator::{parse_lsblk, parse_sessions, Disk};

fn session_listing(targets: usize, luns: usize) -> String {
    let mut text = String::from("iSCSI Transport Class version 2.0-870\nversion 2.1.5\n");
    for t in 0..targets {
        text.push_str(&format!("Target: iqn.2004-08.com.qsan:dev{} (non-flash)\n", t));
        text.push_str(&format!("\tCurrent Portal: 10.0.{}.1:3260,1\n", t));
        text.push_str("\t\tiSCSI Session State: LOGGED_IN\n");
        for lun in 0..luns {
            text.push_str(&format!("\t\tscsi{} Channel 00 Id 0 Lun: {}\n", t, lun));
            text.push_str(&format!("\t\t\tAttached scsi disk sd{}{}\t\tState: running\n", t, lun));
        }
    }
    text
}

fn lsblk_rows(paths: usize) -> String {
    let mut text = String::new();
    for p in 0..paths {
        text.push_str(&format!(
            "sd{p} sd{p}  disk running 10G QSAN\\x20\\x20\\x20\\x20 XF2026 0x2000d42f58000001\n"
        ));
        text.push_str(&format!("mpatha dm-0 sd{p} mpath  10G   \n"));
    }
    text
}

fn benchmark_parse_sessions(c: &mut Criterion) {
    let text = session_listing(8, 16);
    c.bench_function("parse_sessions 8x16", |b| {
        b.iter(|| parse_sessions(black_box(&text)))
    });
}

fn benchmark_consolidate(c: &mut Criterion) {
    let rows = lsblk_rows(8);
    c.bench_function("consolidate 8 paths", |b| {
        b.iter(|| {
            let devices: BTreeMap<_, _> = parse_lsblk(black_box(&rows))
                .into_iter()
                .map(|dev| (dev.kname().to_string(), dev))
                .collect();
            Disk::consolidate(devices, 8, true)
        })
    });
}

criterion_group!(benches, benchmark_parse_sessions, benchmark_consolidate);
criterion_main!(benches);
