//! Classification and bank model properties
//!
//! Exhaustive over the identifier/revision space, and against modules
//! read through the simulated switch.

use pretty_assertions::assert_eq;

use sonic_xcvr_test::{eeprom, init_test_logging, sim_module, SimModule, TestBench};
use sonic_xcvrfw::classifier::{
    self, CMIS_IDS, CMIS_MEDIA_ACTIVE_CABLE, CMIS_MEDIA_BASE_T, CMIS_MEDIA_MMF,
    CMIS_MEDIA_PASSIVE_COPPER, CMIS_MEDIA_SMF, QSFP_PLUS_ID, SFF8636_MIN_REV,
};
use sonic_xcvrfw::{
    ActiveCablePolicy, Bank, FirmwareBankState, FirmwareInfo, LifecycleState, ModuleIdentity,
    TransitionError, XcvrFamily, CORRUPTED_VERSION,
};

#[test]
fn test_classification_is_total_and_deterministic() {
    for id in 0..=u8::MAX {
        for rev in 0..=u8::MAX {
            let family = classifier::classify(id, rev);
            assert_eq!(family, classifier::classify(id, rev));
            assert_eq!(family, classifier::classify_partial(Some(id), Some(rev)));

            // only the shared QSFP+ identifier looks at the revision
            if id != QSFP_PLUS_ID {
                assert_eq!(family, classifier::classify(id, 0), "id {:#04x}", id);
            }
            if family == XcvrFamily::Cmis {
                assert!(CMIS_IDS.contains(&id));
            }
        }
    }
}

#[test]
fn test_qsfp_plus_revision_boundary() {
    for rev in 0..=u8::MAX {
        let expected = if rev >= SFF8636_MIN_REV {
            XcvrFamily::Sff8636
        } else {
            XcvrFamily::Sff8436
        };
        assert_eq!(classifier::classify(QSFP_PLUS_ID, rev), expected, "rev {}", rev);
    }
}

#[test]
fn test_cmis_media_table() {
    let cases = [
        (CMIS_MEDIA_MMF, true),
        (CMIS_MEDIA_SMF, true),
        (CMIS_MEDIA_PASSIVE_COPPER, false),
        (CMIS_MEDIA_BASE_T, false),
        (0x00, false),
        (0x7f, false),
    ];
    for (media, optical) in cases {
        for policy in [ActiveCablePolicy::Optical, ActiveCablePolicy::Electrical] {
            assert_eq!(
                classifier::is_optical(XcvrFamily::Cmis, Some(media), policy),
                optical,
                "media {}",
                media
            );
        }
    }

    assert!(classifier::is_optical(
        XcvrFamily::Cmis,
        Some(CMIS_MEDIA_ACTIVE_CABLE),
        ActiveCablePolicy::Optical
    ));
    assert!(!classifier::is_optical(
        XcvrFamily::Cmis,
        Some(CMIS_MEDIA_ACTIVE_CABLE),
        ActiveCablePolicy::Electrical
    ));
}

#[test]
fn test_unknown_family_is_never_optical() {
    for raw in 0..=u8::MAX {
        let identity = ModuleIdentity::from_bytes(
            Some(0x7f),
            Some(0),
            Some(raw),
            Some(raw),
            ActiveCablePolicy::Optical,
        );
        assert!(identity.is_indeterminate());
        assert_eq!(identity.spec_compliance, None);
        assert!(!identity.is_optical);
        assert!(!identity.is_coherent);
        assert!(!identity.supports_lpmode);
    }
}

#[test]
fn test_lpmode_support_follows_optical() {
    for id in [0x18, 0x11, 0x0d, 0x03] {
        for raw in 0..=u8::MAX {
            let identity =
                ModuleIdentity::from_bytes(Some(id), Some(3), Some(raw), None, Default::default());
            assert_eq!(identity.supports_lpmode, identity.is_optical);
        }
    }
}

#[test]
fn test_coherent_only_for_cmis() {
    for id in [0x11, 0x0d, 0x03] {
        let identity = ModuleIdentity::from_bytes(
            Some(id),
            Some(3),
            Some(0),
            Some(classifier::MEDIA_400ZR_DWDM),
            Default::default(),
        );
        assert!(!identity.is_coherent);
        assert_eq!(identity.app_media_type, None);
    }
}

#[tokio::test]
async fn test_classification_through_platform() {
    init_test_logging();
    let cases: Vec<(&str, SimModule, XcvrFamily, bool)> = vec![
        ("Ethernet0", sim_module(eeprom::cmis_optical()), XcvrFamily::Cmis, true),
        ("Ethernet8", sim_module(eeprom::cmis_dac()), XcvrFamily::Cmis, false),
        ("Ethernet16", sim_module(eeprom::cmis_active_cable()), XcvrFamily::Cmis, true),
        ("Ethernet24", sim_module(eeprom::sff8636_optical()), XcvrFamily::Sff8636, true),
        ("Ethernet32", sim_module(eeprom::sff8636_dac()), XcvrFamily::Sff8636, false),
        ("Ethernet40", sim_module(eeprom::sff8472_optical()), XcvrFamily::Sff8472, true),
        ("Ethernet48", sim_module(eeprom::unknown()), XcvrFamily::Unknown, false),
        ("Ethernet56", sim_module(eeprom::cmis_optical()).absent(), XcvrFamily::Unknown, false),
    ];
    let expected: Vec<(String, XcvrFamily, bool)> = cases
        .iter()
        .map(|(port, _, family, optical)| (port.to_string(), *family, *optical))
        .collect();
    let bench = TestBench::new(
        cases
            .into_iter()
            .map(|(port, module, _, _)| (port, module))
            .collect(),
    )
    .unwrap();

    for (port, family, optical) in expected {
        let module = bench.attach(&port).await;
        assert_eq!(module.identity.family, family, "{}", port);
        assert_eq!(module.identity.is_optical, optical, "{}", port);
        // a non-CMIS module has no observable banks
        if family != XcvrFamily::Cmis {
            assert_eq!(module.bank, FirmwareBankState::unobserved(true), "{}", port);
        }
    }
}

#[tokio::test]
async fn test_unreadable_eeprom_is_indeterminate() {
    init_test_logging();
    let mut module = sim_module(Vec::new());
    module.eeprom = None;
    let bench = TestBench::new(vec![("Ethernet0", module)]).unwrap();

    let attached = bench.attach("Ethernet0").await;
    assert_eq!(attached.identity, ModuleIdentity::indeterminate());
}

// ---- bank model ---------------------------------------------------------------

fn bank() -> FirmwareBankState {
    FirmwareBankState::from_info(
        &FirmwareInfo {
            image_a: Some("1.0.0".to_string()),
            image_b: Some("0.9.0".to_string()),
            factory: None,
            running: Bank::A,
            committed: Bank::A,
            active: "1.0.0".to_string(),
            inactive: "0.9.0".to_string(),
        },
        true,
    )
}

#[derive(Debug, Clone, Copy)]
enum Event {
    Stage,
    Staged,
    Abort,
    Fail,
    FailLanded,
    Run,
    Commit,
}

const EVENTS: [Event; 7] = [
    Event::Stage,
    Event::Staged,
    Event::Abort,
    Event::Fail,
    Event::FailLanded,
    Event::Run,
    Event::Commit,
];

fn apply(bank: &mut FirmwareBankState, event: Event) -> Result<(), TransitionError> {
    match event {
        Event::Stage => bank.begin_staging(),
        Event::Staged => bank.finish_staged("1.1.0"),
        Event::Abort => bank.finish_aborted(CORRUPTED_VERSION),
        Event::Fail => bank.finish_failed(CORRUPTED_VERSION),
        Event::FailLanded => bank.finish_failed_with("1.1.0"),
        Event::Run => bank.run(XcvrFamily::Cmis),
        Event::Commit => {
            let target = bank.running_bank;
            bank.commit(XcvrFamily::Cmis, target)
        }
    }
}

#[test]
fn test_every_event_sequence_respects_the_graph() {
    // all sequences of four events
    let mut sequences: Vec<Vec<Event>> = vec![Vec::new()];
    for _ in 0..4 {
        sequences = sequences
            .into_iter()
            .flat_map(|seq| {
                EVENTS.iter().map(move |e| {
                    let mut next = seq.clone();
                    next.push(*e);
                    next
                })
            })
            .collect();
    }
    assert_eq!(sequences.len(), EVENTS.len().pow(4));

    for sequence in sequences {
        let mut model = bank();
        for event in &sequence {
            let before = model.clone();
            match apply(&mut model, *event) {
                Ok(()) => {
                    assert!(
                        before.state.can_transition_to(model.state),
                        "{:?}: {} -> {}",
                        sequence,
                        before.state,
                        model.state
                    );
                    assert_ne!(model.active_version, CORRUPTED_VERSION);
                }
                Err(_) => assert_eq!(model, before, "{:?}", sequence),
            }
        }
    }
}

#[test]
fn test_run_swaps_and_commit_moves_bank() {
    let mut model = bank();
    model.begin_staging().unwrap();
    model.finish_staged("1.1.0").unwrap();
    model.run(XcvrFamily::Cmis).unwrap();
    assert_eq!(model.active_version, "1.1.0");
    assert_eq!(model.inactive_version, "1.0.0");
    assert_eq!(model.running_bank, Bank::B);

    assert_eq!(
        model.commit(XcvrFamily::Cmis, Bank::A),
        Err(TransitionError::CommittedBankUnchanged { bank: Bank::A })
    );
    assert_eq!(model.state, LifecycleState::Running);
    model.commit(XcvrFamily::Cmis, Bank::B).unwrap();
    assert_eq!(model.state, LifecycleState::Committed);
    assert!(model.state.can_stage());
}

#[test]
fn test_single_bank_never_stages() {
    let mut model = FirmwareBankState::unobserved(false);
    assert_eq!(model.begin_staging(), Err(TransitionError::NoDualBank));
    assert_eq!(model.state, LifecycleState::Idle);
}
