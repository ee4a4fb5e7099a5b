use core::fmt::Write;

use heapless::String;

use super::{ModuleParams, SetupStep, COMMAND_MAX_LENGTH};

/// SIM7000 family (SIM7000A/E/G, Cat-M1/NB-IoT).
///
/// LTE-class part; the PDP context is defined through `AT+CGDCONT` and a
/// dropped context is announced with `+PDP: DEACT`.
#[derive(Debug, Clone, Copy)]
pub struct Sim7000;

impl ModuleParams for Sim7000 {
    const CLOSE_TOKEN: &'static str = "+PDP: DEACT";
    const MAX_RECEIVE_SIZE: u16 = 1500;
    const SETUP: &'static [SetupStep] = &[
        SetupStep::Command("AT"),
        SetupStep::Command("ATE0"),
        SetupStep::Command("AT+CPIN?"),
        SetupStep::Command("AT+CSQ"),
        SetupStep::Command("AT+CREG?"),
        SetupStep::DefineApn,
        SetupStep::Command("AT+CGATT=1"),
        SetupStep::Command("AT+CIPMUX=1"),
        SetupStep::Command("AT+CIPRXGET=1"),
    ];

    fn apn_command(apn: &str) -> Option<String<COMMAND_MAX_LENGTH>> {
        let mut cmd = String::new();
        write!(cmd, "AT+CGDCONT=1,\"IP\",\"{}\"", apn).ok()?;
        Some(cmd)
    }
}
