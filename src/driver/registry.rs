//! Per-driver registry keyed by `InstrumentConfig.type` (spec §4.B, Design
//! Notes "Polymorphism": "Express it as a narrow `Driver` capability and a
//! per-driver registry keyed by `type`. Add simulation by providing a
//! `SimulatedTransport` that every driver can accept.").

use std::time::Duration;

use crate::driver::analog_discovery::AnalogDiscoveryDriver;
use crate::driver::daq_dmm::{DaqDmmDriver, DaqModel};
use crate::driver::generic_command::GenericCommandDriver;
use crate::driver::keithley2015::Keithley2015Driver;
use crate::driver::mdo34::Mdo34Driver;
use crate::driver::power_supply::{PowerSupplyDriver, PowerSupplyModel};
use crate::driver::relay::RelayDriver;
use crate::driver::smcv100b::Smcv100bDriver;
use crate::driver::wait::WaitDriver;
use crate::driver::wireless_tester::{WirelessTesterDriver, WirelessTesterModel};
use crate::driver::Driver;
use crate::error::{EngineError, EngineResult};
use crate::transport::simulated::SimulatedTransport;
use crate::transport::Transport;

/// Build a driver instance for a recognized `type` string, wiring it to the
/// supplied transport (a real one, or a [`SimulatedTransport`] when the
/// instrument's `connection` is `Simulated`; spec §4.B.2).
///
/// Families that require a framed duplex stream (chassis fixture, LS
/// safety) or a datagram transport (VCU) are constructed directly by the
/// connection pool, which already holds the concrete stream type; this
/// registry only covers the families that speak through the `Transport`
/// trait object.
pub fn build_driver(
    driver_type: &str,
    transport: Box<dyn Transport>,
) -> EngineResult<Box<dyn Driver>> {
    let timeout = Duration::from_secs(5);
    let driver: Box<dyn Driver> = match driver_type {
        "Model2303" => Box::new(PowerSupplyDriver::new(PowerSupplyModel::Model2303, transport)),
        "Model2306" => Box::new(PowerSupplyDriver::new(PowerSupplyModel::Model2306, transport)),
        "Model2260B" => Box::new(PowerSupplyDriver::new(PowerSupplyModel::Model2260B, transport)),
        "IT6723C" => Box::new(PowerSupplyDriver::new(PowerSupplyModel::It6723c, transport)),
        "PSW3072" => Box::new(PowerSupplyDriver::new(PowerSupplyModel::Psw3072, transport)),

        "DAQ973A" => Box::new(DaqDmmDriver::new(DaqModel::Daq973a, transport)),
        "DAQ34970A" => Box::new(DaqDmmDriver::new(DaqModel::Daq34970a, transport)),
        "APS7050" => Box::new(DaqDmmDriver::new(DaqModel::Aps7050, transport)),
        "DAQ6510" => Box::new(DaqDmmDriver::new(DaqModel::Daq6510, transport)),

        "Keithley2015" => Box::new(Keithley2015Driver::new(transport)),

        "CMW100" => Box::new(WirelessTesterDriver::new(WirelessTesterModel::Cmw100, transport)),
        "MT8872A" => Box::new(WirelessTesterDriver::new(WirelessTesterModel::Mt8872a, transport)),

        "AnalogDiscovery2" => Box::new(AnalogDiscoveryDriver::new()),

        "MDO34" => Box::new(Mdo34Driver::new(transport)),

        "ComPort" | "TCPIP" | "Console" | "SSH" | "SSHComPort" | "comport" | "tcpip" | "console" => {
            Box::new(GenericCommandDriver::new(transport, timeout))
        }

        "wait" | "Wait" => Box::new(WaitDriver::new()),

        "relay" | "chassis_rotation" | "Relay" => Box::new(RelayDriver::new(transport)),

        "SMCV100B" => Box::new(Smcv100bDriver::new(transport)),

        other => {
            return Err(EngineError::BadParameter(format!(
                "no driver registered for instrument type '{other}'"
            )))
        }
    };
    Ok(driver)
}

/// Construct the simulated transport every family accepts (spec §4.B.2).
pub fn simulated_transport_for(model: &str) -> Box<dyn Transport> {
    Box::new(SimulatedTransport::new(model))
}

/// The full set of `type` strings this registry recognizes, for config
/// validation at load time.
pub fn known_driver_types() -> &'static [&'static str] {
    &[
        "Model2303",
        "Model2306",
        "Model2260B",
        "IT6723C",
        "PSW3072",
        "DAQ973A",
        "DAQ34970A",
        "APS7050",
        "DAQ6510",
        "Keithley2015",
        "CMW100",
        "MT8872A",
        "AnalogDiscovery2",
        "MDO34",
        "ComPort",
        "TCPIP",
        "Console",
        "SSH",
        "SSHComPort",
        "wait",
        "relay",
        "chassis_rotation",
        "SMCV100B",
        "ChassisFixture",
        "LsSafety",
        "Vcu",
        "PeakCan",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_driver_rejects_unknown_type() {
        let err = build_driver("NotARealInstrument", simulated_transport_for("x")).unwrap_err();
        assert!(matches!(err, EngineError::BadParameter(_)));
    }

    #[test]
    fn build_driver_accepts_each_known_type() {
        for ty in known_driver_types() {
            match *ty {
                "ChassisFixture" | "LsSafety" | "Vcu" | "PeakCan" => continue,
                other => {
                    assert!(build_driver(other, simulated_transport_for("x")).is_ok());
                }
            }
        }
    }
}
