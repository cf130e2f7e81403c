//! Devices built from provisioning files, as the simulators build them.

use keyfob_core::{Car, CarEvent, CarStatus, Fob, FobShell};
use keyfob_platform::file::FileStore;
use keyfob_platform::mock::MockChannel;
use keyfob_tools::{authority, CarProvisioning, FobPairing, FobProvisioning};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io::Cursor;
use std::path::Path;
use std::thread;

struct Deployment {
    car: CarProvisioning,
    fob: FobProvisioning,
    unpaired: FobProvisioning,
}

fn deploy(dir: &Path) -> Deployment {
    let (sk, pk) = (dir.join("authority.sk"), dir.join("authority.pk"));
    let public_hex = authority::gen_keypair(&sk, &pk).unwrap();
    let secret = authority::gen_secret().to_string();

    let car = CarProvisioning {
        car_id: 500,
        shared_secret: secret.clone(),
        authority_public_key: public_hex.clone(),
        unlock_message: "Welcome".into(),
        feature_messages: vec!["Cruise".into(), "Radio".into(), "Seats".into()],
        protocol_timeout_ms: None,
    };
    let fob = FobProvisioning {
        paired: Some(FobPairing {
            car_id: 500,
            pin: "908172".into(),
            shared_secret: secret,
        }),
        authority_public_key: public_hex.clone(),
        protocol_timeout_ms: None,
    };
    let unpaired = FobProvisioning {
        paired: None,
        authority_public_key: public_hex,
        protocol_timeout_ms: None,
    };
    car.save(dir.join("car.json")).unwrap();
    fob.save(dir.join("fob.json")).unwrap();
    Deployment { car, fob, unpaired }
}

#[test]
fn test_provisioned_devices_unlock_and_start() {
    let dir = tempfile::tempdir().unwrap();
    let deployment = deploy(dir.path());
    let car_prov = CarProvisioning::load(dir.path().join("car.json")).unwrap();
    assert_eq!(car_prov, deployment.car);
    let fob_prov = FobProvisioning::load(dir.path().join("fob.json")).unwrap();

    let package = dir.path().join("radio.hex");
    authority::sign_feature(500, 2, &dir.path().join("authority.sk"), &package).unwrap();
    let package_hex = std::fs::read_to_string(&package).unwrap();

    let (car_end, fob_end) = MockChannel::pair();
    let car_store = FileStore::new(dir.path().join("car.state"));
    let car = thread::spawn(move || {
        let record = car_prov.record().unwrap();
        let mut car = Car::boot(
            car_prov.car_id,
            car_end,
            car_store,
            move || record,
            car_prov.session_config().unwrap(),
            StdRng::seed_from_u64(3),
            Vec::new(),
        )
        .unwrap();
        let mut last = CarEvent::Nothing;
        for _ in 0..3 {
            last = car.step().unwrap();
        }
        (car.status(), car.output().clone(), last)
    });

    let factory = fob_prov.factory_state().unwrap();
    let mut fob = Fob::boot(
        fob_end,
        FileStore::new(dir.path().join("fob.state")),
        move || factory,
        fob_prov.session_config().unwrap(),
    )
    .unwrap();
    let input = format!("enable\n{}unlock\n", package_hex);
    let mut shell = FobShell::new(&mut fob, Cursor::new(input.into_bytes()), Vec::new());
    shell.run().unwrap();
    assert_eq!(shell.output(), b"Enabled\n");

    let (status, output, last) = car.join().unwrap();
    assert_eq!(status, CarStatus::Started);
    assert_eq!(output, b"Welcome\nRadio\n");
    assert_eq!(last, CarEvent::Started { features: vec![2] });
    assert!(dir.path().join("car.state").exists());
}

#[test]
fn test_pairing_persists_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let deployment = deploy(dir.path());
    let state_path = dir.path().join("new-fob.state");

    let (paired_end, unpaired_end) = MockChannel::pair();
    let unpaired = deployment.unpaired.clone();
    let path = state_path.clone();
    let responder = thread::spawn(move || {
        let factory = unpaired.factory_state().unwrap();
        let mut fob = Fob::boot(
            unpaired_end,
            FileStore::new(path),
            move || factory,
            unpaired.session_config().unwrap(),
        )
        .unwrap();
        let mut shell = FobShell::new(&mut fob, Cursor::new(b"pair\n".to_vec()), Vec::new());
        shell.run().unwrap();
        shell.output().clone()
    });

    let factory = deployment.fob.factory_state().unwrap();
    let mut fob = Fob::boot(
        paired_end,
        FileStore::new(dir.path().join("fob.state")),
        move || factory,
        deployment.fob.session_config().unwrap(),
    )
    .unwrap();
    let mut shell = FobShell::new(&mut fob, Cursor::new(b"pair\n908172\n".to_vec()), Vec::new());
    shell.run().unwrap();
    assert_eq!(responder.join().unwrap(), b"Paired\n");

    // Reboot the new fob from its file: it must come up paired.
    let (channel, _peer) = MockChannel::pair();
    let unpaired = deployment.unpaired;
    let factory = unpaired.factory_state().unwrap();
    let rebooted = Fob::boot(
        channel,
        FileStore::new(&state_path),
        move || factory,
        unpaired.session_config().unwrap(),
    )
    .unwrap();
    assert!(rebooted.is_paired());
    assert_eq!(rebooted.state().features.car_id, 500);
}
