//! Instrument session against a scripted bus, through to the sample file.

use labrelay::bus::{open_bus, BusSettings, MockBus};
use labrelay::config::LabRelayConfig;
use labrelay::output::{sweep_file_name, SampleMetadata, SampleWriter};
use labrelay::session::{
    Coupling, Impedance, InstrumentSession, MeasurementOptions, MeasurementProfile, Slope,
};
use labrelay::RelayError;

fn counter_options() -> MeasurementOptions {
    MeasurementOptions {
        slope: Slope::Positive,
        threshold_v: 0.2,
        coupling: Coupling::Ac,
        impedance_ohm: Impedance::OneMeg,
        timeout_ms: 5_000,
        sample_count: 4,
        gate_time_s: 0.1,
    }
}

#[tokio::test]
async fn test_frequency_session_full_command_sequence() {
    let bus = MockBus::new("TCPIP0::192.168.1.50::INSTR")
        .with_reply("FETC?", "+1.000000E+07,+1.000001E+07,+9.999990E+06,+1.000000E+07");

    let mut session = InstrumentSession::open(
        Box::new(bus.clone()),
        MeasurementProfile::Frequency,
        counter_options(),
    )
    .await
    .unwrap();
    let samples = session.acquire().await.unwrap();
    session.close();

    assert_eq!(samples.len(), 4);
    assert_eq!(samples[2], 9.99999e6);
    assert_eq!(
        bus.call_log(),
        vec![
            "*RST",
            "CONF:FREQ (@1)",
            "INP1:COUP AC",
            "INP1:IMP 1E6",
            "INP1:SLOP POS",
            "INP1:LEV 0.2",
            "FREQ:GATE:SOUR TIME",
            "FREQ:GATE:TIME 0.1",
            "SAMP:COUN 4",
            "INIT",
            "*OPC?",
            "FETC?",
        ]
    );
}

#[tokio::test]
async fn test_session_on_bus_from_settings() {
    let bus = open_bus(&BusSettings::mock()).await.unwrap();
    let mut session = InstrumentSession::open(
        bus,
        MeasurementProfile::DcVoltage,
        MeasurementOptions::default(),
    )
    .await
    .unwrap();
    assert!(session.identify().await.unwrap().starts_with("Mock Instruments"));
    // Unscripted fetch replies are empty.
    assert!(session.acquire().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_non_numeric_fetch_is_device_fault() {
    let bus = MockBus::new("GPIB0::5::INSTR").with_reply("FETC?", "+1.0E+00,9.91E+37,ERR");
    let mut session = InstrumentSession::open(
        Box::new(bus),
        MeasurementProfile::Totalize,
        counter_options(),
    )
    .await
    .unwrap();
    assert!(matches!(
        session.acquire().await,
        Err(RelayError::DeviceFault(_))
    ));
}

#[tokio::test]
async fn test_acquired_samples_written_to_named_file() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("labrelay.toml");
    let output_dir = dir.path().join("runs");
    std::fs::write(
        &config_path,
        format!(
            r#"
            [relay]
            preset = "frequency_counter"

            [session]
            profile = "time_interval"
            output_dir = "{}"
            file_prefix = "ti"

            [session.bus]
            kind = "mock"

            [session.options]
            slope = "NEG"
            threshold_v = -0.1
            sample_count = 3

            [session.file_params]
            bias = 0.1
            "#,
            output_dir.display()
        ),
    )
    .unwrap();

    let config = LabRelayConfig::load_from(&config_path).unwrap();
    let session_config = config.session.unwrap();

    let bus = MockBus::new("MOCK::INSTR").with_reply("FETC?", "1.0E-06,2.0E-06,3.0E-06");
    let mut session = InstrumentSession::open(
        Box::new(bus),
        session_config.profile,
        session_config.options.clone(),
    )
    .await
    .unwrap();
    let samples = session.acquire().await.unwrap();

    let name = sweep_file_name(
        &session_config.file_prefix,
        session_config
            .file_params
            .iter()
            .map(|(key, value)| (key.as_str(), *value)),
        "csv",
    );
    assert_eq!(name, "ti_bias-0p1.csv");

    let path = session_config.output_dir.join(name);
    let metadata = SampleMetadata::new(
        session_config.profile,
        "MOCK::INSTR",
        session_config.options.clone(),
    );
    let mut writer = SampleWriter::create(&path, &metadata).unwrap();
    writer.write_samples(&samples).unwrap();
    assert_eq!(writer.finish().unwrap(), 3);

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("\"profile\": \"time_interval\""));
    assert!(text.lines().any(|line| line == "index,value"));
    assert!(text.lines().any(|line| line == "2,0.000003"));
}
