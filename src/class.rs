use core::cmp::min;
use core::marker::PhantomData;
use usb_device::{class_prelude::*, control::Request};

const USB_CLASS_APPLICATION_SPECIFIC: u8 = 0xFE;
const USB_SUBCLASS_DFU: u8 = 0x01;

#[allow(dead_code)]
const USB_PROTOCOL_RUN_TIME: u8 = 0x01;
const USB_PROTOCOL_DFU_MODE: u8 = 0x02;

#[allow(dead_code)]
const DFU_DETACH: u8 = 0x00;
const DFU_DNLOAD: u8 = 0x01;
const DFU_UPLOAD: u8 = 0x02;
const DFU_GETSTATUS: u8 = 0x03;
const DFU_CLRSTATUS: u8 = 0x04;
const DFU_GETSTATE: u8 = 0x05;
const DFU_ABORT: u8 = 0x06;

const DESC_DESCTYPE_DFU: u8 = 0x21;

/// DFU protocol state, as reported by `DFU_GETSTATE`/`DFU_GETSTATUS` and
/// consumed by [`DFUMemIO::usb_reset_override`].
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DFUState {
    /// Device is running its normal application.
    AppIdle = 0,
    /// Device is running its normal application, has received the DFU_DETACH request, and is waiting for a USB reset.
    AppDetach = 1,
    /// Device is operating in the DFU mode and is waiting for requests.
    DfuIdle = 2,
    /// Device has received a block and is waiting for the host to solicit the status via DFU_GETSTATUS.
    DfuDnloadSync = 3,
    /// Device is programming a control-write block into its nonvolatile memories.
    DfuDnBusy = 4,
    /// Device is processing a download operation. Expecting DFU_DNLOAD requests.
    DfuDnloadIdle = 5,
    /// Device has received the final block of firmware from the hostand is waiting for receipt of DFU_GETSTATUS to begin the Manifestation phase; or device has completed the Manifestation phase and is waiting for receipt of DFU_GETSTATUS. (Devices that can enter this state after the Manifestation phase set bmAttributes bit bitManifestationTolerant to 1.)
    DfuManifestSync = 6,
    /// Device is in the Manifestation phase. (Not all devices will be able to respond to DFU_GETSTATUS when in this state.)
    DfuManifest = 7,
    /// Device has programmed its memories and is waiting for a USB reset or a power on reset. (Devices that must enter this state clear bitManifestationTolerant to 0.)
    DfuManifestWaitReset = 8,
    /// The device is processing an upload operation. Expecting DFU_UPLOAD requests.
    DfuUploadIdle = 9,
    /// An error has occurred. Awaiting the DFU_CLRSTATUS request.
    DfuError = 10,
}

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
enum DFUStatusCode {
    /// No error condition is present.
    OK = 0x00,
    /// File is not targeted for use by this device.
    ErrTarget = 0x01,
    /// File is for this device but fails some vendor-specific verification test.
    ErrFile = 0x02,
    /// Device is unable to write memory.
    ErrWrite = 0x03,
    /// Memory erase function failed.
    ErrErase = 0x04,
    /// Memory erase check failed.
    ErrCheckErased = 0x05,
    /// Program memory function failed.
    ErrProg = 0x06,
    /// Programmed memory failed verification.
    ErrVerify = 0x07,
    /// Cannot program memory due to received address that is out of range.
    ErrAddress = 0x08,
    /// Received DFU_DNLOAD with wLength = 0, but device does not think it has all of the data yet.
    ErrNotdone = 0x09,
    /// Device’s firmware is corrupt. It cannot return to run-time (non-DFU) operations.
    ErrFirmware = 0x0A,
    /// iString indicates a vendor-specific error.
    ErrVendor = 0x0B,
    /// Device detected unexpected USB reset signaling.
    ErrUsbr = 0x0C,
    /// Device detected unexpected power on reset.
    ErrPOR = 0x0D,
    /// Something went wrong, but the device does not know what it was.
    ErrUnknown = 0x0E,
    /// Device stalled an unexpected request.
    ErrStalledPkt = 0x0F,
}

/// Errors that may happen when working with the memory
/// (reading, erasing, writting). These will be translated
/// to a corresponding error codes in DFU protocol.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DFUMemError {
    /// File is not targeted for use by this device.
    Target = DFUStatusCode::ErrTarget as u8,
    /// File is for this device but fails some vendor-specific verification test.
    File = DFUStatusCode::ErrFile as u8,
    /// Device is unable to write memory.
    Write = DFUStatusCode::ErrWrite as u8,
    /// Memory erase function failed.
    Erase = DFUStatusCode::ErrErase as u8,
    /// Memory erase check failed.
    CheckErased = DFUStatusCode::ErrCheckErased as u8,
    /// Program memory function failed.
    Prog = DFUStatusCode::ErrProg as u8,
    /// Programmed memory failed verification.
    Verify = DFUStatusCode::ErrVerify as u8,
    /// Something went wrong, but the device does not know what it was.
    Unknown = DFUStatusCode::ErrUnknown as u8,
    /// Cannot program memory due to a block number that is out of range.
    Address = DFUStatusCode::ErrAddress as u8,
    /// A vendor-specific error. iString in DFU_GETSTATUS reply will always be 0.
    ErrVendor = DFUStatusCode::ErrVendor as u8,
}

/// Errors that may happen when device enter Manifestation phase
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DFUManifestationError {
    /// File is not targeted for use by this device.
    Target = DFUStatusCode::ErrTarget as u8,
    /// File is for this device but fails some vendor-specific verification test.
    File = DFUStatusCode::ErrFile as u8,
    /// Received DFU_DNLOAD with wLength = 0, but device does not think it has all of the data yet.
    NotDone = DFUStatusCode::ErrNotdone as u8,
    /// Device’s firmware is corrupt. It cannot return to run-time (non-DFU) operations.
    Firmware = DFUStatusCode::ErrFirmware as u8,
    /// A vendor-specific error. iString in DFU_GETSTATUS reply will always be 0.
    ErrVendor = DFUStatusCode::ErrVendor as u8,
    /// Something went wrong, but the device does not know what it was.
    Unknown = DFUStatusCode::ErrUnknown as u8,
}

/// Trait that describes the abstraction used to access memory
/// on a device. [`DFUClass`] will call corresponding
/// functions and will use provided constants to tailor
/// DFU features and, for example time interval values that
/// are used in the protocol.
pub trait DFUMemIO {
    /// Human-readable description of the interface, reported as its USB
    /// string descriptor (e.g. shown by `dfu-util -l`).
    const MEM_INFO_STRING: &'static str;

    /// If set, DFU descriptor will have *bitCanDnload* bit set. Default is `true`.
    ///
    /// Should be set to true if firmware download (host to device) is supported.
    const HAS_DOWNLOAD: bool = true;

    /// If set, DFU descriptor will have *bitCanUpload* bit set. Default is `true`.
    ///
    /// Should be set to true if firmware upload (device to host) is supported.
    const HAS_UPLOAD: bool = true;

    /// If set, DFU descriptor will have *bitManifestationTolerant* bit set. Default is `true`.
    ///
    /// See also [`MANIFESTATION_TIME_MS`](DFUMemIO::MANIFESTATION_TIME_MS).
    const MANIFESTATION_TOLERANT: bool = true;

    /// Time in milliseconds host must wait before issuing the next command after
    /// block program request.
    ///
    /// This is the time that program of one block or [`TRANSFER_SIZE`](DFUMemIO::TRANSFER_SIZE) bytes
    /// takes.
    ///
    /// DFU programs data as follows:
    ///
    /// > 1. Host transfers `TRANSFER_SIZE` bytes to a device
    /// > 2. Device stores this data in a buffer
    /// > 3. Host issues `DFU_GETSTATUS` command, confirms that device state is correct,
    /// >    and checks the reply for 24-bit value how much time it must wait
    /// >    before issuing the next command. Device, after submitting a reply
    /// >    starts program operation.
    /// > 4. After waiting for a specified number of milliseconds, host continues to send new commands.
    const PROGRAM_TIME_MS: u32;

    /// Time in milliseconds host must wait after submitting the final firware download
    /// (host to device) command. Default is `1` ms.
    ///
    /// DFU protocol allows the device to enter a Manifestation state when it can activate
    /// the uploaded firmware.
    ///
    /// After the activation is completed, device may need to reset (if
    /// [`MANIFESTATION_TOLERANT`](DFUMemIO::MANIFESTATION_TOLERANT) is `false`), or it can return to IDLE state
    /// (if `MANIFESTATION_TOLERANT` is `true`)
    ///
    /// See also [`PROGRAM_TIME_MS`](DFUMemIO::PROGRAM_TIME_MS).
    const MANIFESTATION_TIME_MS: u32 = 1;

    /// wDetachTimeOut field in DFU descriptor. Default value: `250` ms.
    ///
    /// Probably unused if device does not support DFU in run-time mode to
    /// handle `DFU_DETACH` command.
    ///
    /// Time in milliseconds that device will wait after receipt of `DFU_DETACH` request
    /// if USB reset request is not received before reverting to a normal operation.
    const DETACH_TIMEOUT: u16 = 250;

    /// Maximum allowed transfer size. Default value: `128` bytes.
    ///
    /// This is the maximum size of a block for [`req_upload_data()`](DFUMemIO::req_upload_data)
    /// and [`req_dnload_data()`](DFUMemIO::req_dnload_data).
    ///
    /// All DFU transfers use Control endpoint only.
    ///
    /// **Warning**: must be less or equal of `usb-device`'s control endpoint buffer size (usually `128` bytes),
    /// otherwise data transfers may fail for no obvious reason.
    const TRANSFER_SIZE: u16 = 128;

    /// Collect data which comes from USB, possibly in chunks, to a buffer in RAM.
    ///
    /// [`DFUClass`] does not have an internal memory buffer for a read/write operations,
    /// incoming data should be stored in a buffer managed by this trait's implementation.
    ///
    /// This function should not write data to Flash or trigger memory Erase.
    ///
    /// The same buffer may be shared for both write and read operations.
    /// DFU protocol will not trigger block write while sending data to host, and
    /// will ensure that buffer has valid data before program operation is requested.
    ///
    /// This function is called from `usb_dev.poll([])` (USB interrupt context).
    ///
    fn store_write_buffer(&mut self, src: &[u8]) -> Result<(), ()>;

    /// Returns up to `length` bytes of the firmware image for block `block_num`,
    /// the host's `wValue` on the `DFU_UPLOAD` request that solicited this call.
    ///
    /// If Upload operation is supported ([`HAS_UPLOAD`](DFUMemIO::HAS_UPLOAD) is `true`), this function
    /// returns memory contents to a host. Returning fewer bytes than `length` ends the
    /// upload (signals the last block of the image); returning more than `length` is
    /// rejected by the caller as a protocol error.
    ///
    /// Implementation must check that `block_num` is within the image and reject it
    /// otherwise.
    ///
    /// This function is called from `usb_dev.poll([])` (USB interrupt context).
    ///
    fn req_upload_data(&mut self, block_num: u16, length: usize) -> Result<&[u8], DFUMemError>;

    /// Commits the bytes most recently staged via [`store_write_buffer`](DFUMemIO::store_write_buffer)
    /// as block `block_num`, the host's `wValue` on the `DFU_DNLOAD` request that staged them.
    ///
    /// Implementation must check that `block_num` is valid and that the whole
    /// block fits in the target region, returning an error otherwise.
    ///
    /// This function is called from `usb_dev.poll([])` (USB interrupt context).
    ///
    fn req_dnload_data(&mut self, block_num: u16, length: usize) -> Result<(), DFUMemError>;

    /// Finish writing firmware to a persistent storage, and optionally activate it.
    ///
    /// This funciton should return if [`MANIFESTATION_TOLERANT`](DFUMemIO::MANIFESTATION_TOLERANT) is `true`.
    ///
    /// This funciton should not return `Ok()` if `MANIFESTATION_TOLERANT` is `false`.
    /// Instead device should activate and start new main firmware.
    ///
    /// This function is called from `usb_dev.poll([])` (USB interrupt context).
    ///
    fn manifestation(&mut self) -> Result<(), DFUManifestationError>;

    /// Called on a zero-length DNLOAD that ends a download session (the host
    /// has no more blocks to send), before the device transitions towards
    /// manifestation. Return `true` iff the image received so far is
    /// complete and acceptable. Default is `true`.
    ///
    /// Returning `false` moves the device to `DfuError` with status
    /// `ErrNotdone` instead of starting manifestation, per the DFU 1.1
    /// state machine.
    fn is_transfer_complete(&mut self) -> bool {
        true
    }

    /// Returns `true` iff the currently stored firmware image is valid and
    /// runnable. Consulted when a USB bus reset would otherwise return the
    /// device to `AppIdle`. Default is `true`.
    fn is_firmware_valid(&mut self) -> bool {
        true
    }

    /// Called once, on the reset path, whenever the computed next state
    /// after a USB bus reset is `AppIdle` — i.e. the device is leaving DFU
    /// mode for good. Implementations typically jump to the runtime
    /// firmware image from here and do not return. Default is a no-op,
    /// appropriate for a standalone bootloader that simply stays resident.
    fn reboot_to_runtime(&mut self) {}

    /// Lets the application override the state a USB bus reset computes,
    /// for any state other than `AppDetach` (which always promotes to
    /// `DfuIdle`). Returning `Some(state)` replaces the driver's own
    /// decision (the `is_firmware_valid`/`reboot_to_runtime` path is not
    /// consulted in that case); returning `None` (the default) leaves the
    /// driver's own policy in effect.
    ///
    /// This function is called from `usb_dev.poll([])`'s bus reset handling
    /// (USB interrupt context), before [`reboot_to_runtime`](DFUMemIO::reboot_to_runtime)
    /// would otherwise run.
    fn usb_reset_override(&mut self, current_state: DFUState) -> Option<DFUState> {
        let _ = current_state;
        None
    }

    /// Handles a class request outside the standard seven DFU requests, or
    /// any vendor request addressed to the DFU interface. Return `true` if
    /// handled (the transfer is acknowledged with no payload); `false` (the
    /// default) stalls the request.
    fn handle_nonstandard_request(&mut self, request: u8) -> bool {
        let _ = request;
        false
    }

    /// String-descriptor index reported as `iString` in the `DFU_GETSTATUS`
    /// reply, to let a host resolve a vendor-specific status description.
    /// Default is `0` (none).
    fn status_string_index(&mut self) -> u8 {
        0
    }

    /// Application-level cleanup when `DFU_ABORT` is received while in
    /// `DfuIdle`, `DfuDnloadIdle`, `DfuUploadIdle`, or `DfuManifestSync`.
    /// Default is a no-op.
    fn on_abort(&mut self) {}
}

impl From<DFUMemError> for DFUStatusCode {
    fn from(e: DFUMemError) -> Self {
        match e {
            DFUMemError::File => DFUStatusCode::ErrFile,
            DFUMemError::Target => DFUStatusCode::ErrTarget,
            DFUMemError::Address => DFUStatusCode::ErrAddress,
            DFUMemError::CheckErased => DFUStatusCode::ErrCheckErased,
            DFUMemError::Erase => DFUStatusCode::ErrErase,
            DFUMemError::Write => DFUStatusCode::ErrWrite,
            DFUMemError::Prog => DFUStatusCode::ErrProg,
            DFUMemError::Verify => DFUStatusCode::ErrVerify,
            DFUMemError::Unknown => DFUStatusCode::ErrUnknown,
            DFUMemError::ErrVendor => DFUStatusCode::ErrVendor,
        }
    }
}

impl From<DFUManifestationError> for DFUStatusCode {
    fn from(e: DFUManifestationError) -> Self {
        match e {
            DFUManifestationError::NotDone => DFUStatusCode::ErrNotdone,
            DFUManifestationError::Firmware => DFUStatusCode::ErrFirmware,
            DFUManifestationError::Unknown => DFUStatusCode::ErrUnknown,
            DFUManifestationError::ErrVendor => DFUStatusCode::ErrVendor,
            DFUManifestationError::File => DFUStatusCode::ErrFile,
            DFUManifestationError::Target => DFUStatusCode::ErrTarget,
        }
    }
}

/// DFU protocol USB class implementation for usb-device library.
pub struct DFUClass<B: UsbBus, M: DFUMemIO> {
    if_num: InterfaceNumber,
    status: DFUStatus,
    interface_string: StringIndex,
    _bus: PhantomData<B>,
    mem: M,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Command {
    None,
    WriteMemory { block_num: u16, len: u16 },
    LeaveDFU,
}

#[derive(Clone, Copy)]
struct DFUStatus {
    status: DFUStatusCode,
    poll_timeout: u32,
    state: DFUState,
    istring: u8,
    command: Command,
    pending: Command,
}

impl DFUStatus {
    pub fn new() -> Self {
        Self {
            status: DFUStatusCode::OK,
            poll_timeout: 0,
            state: DFUState::DfuIdle,
            istring: 0,
            command: Command::None,
            pending: Command::None,
        }
    }

    fn new_state_ok(&mut self, state: DFUState) {
        self.new_state_status(state, DFUStatusCode::OK);
    }

    fn new_state_status(&mut self, state: DFUState, status: DFUStatusCode) {
        self.status = status;
        self.state = state;
    }

    fn state(&self) -> DFUState {
        self.state
    }
}

impl From<DFUStatus> for [u8; 6] {
    fn from(dfu: DFUStatus) -> Self {
        [
            // bStatus
            dfu.status as u8,
            // bwPollTimeout
            (dfu.poll_timeout & 0xff) as u8,
            ((dfu.poll_timeout >> 8) & 0xff) as u8,
            ((dfu.poll_timeout >> 16) & 0xff) as u8,
            // bState
            dfu.state as u8,
            // iString: Index of status description in string table.
            dfu.istring,
        ]
    }
}

impl<B: UsbBus, M: DFUMemIO> UsbClass<B> for DFUClass<B, M> {
    fn get_configuration_descriptors(
        &self,
        writer: &mut DescriptorWriter,
    ) -> usb_device::Result<()> {
        writer.interface_alt(
            self.if_num,
            0,
            USB_CLASS_APPLICATION_SPECIFIC,
            USB_SUBCLASS_DFU,
            USB_PROTOCOL_DFU_MODE,
            Some(self.interface_string),
        )?;

        // DFU Functional descriptor
        writer.write(
            DESC_DESCTYPE_DFU,
            &[
                // bmAttributes
                // Bit 7: bitAcceleratedST
                (if false {0x80} else {0}) |
                    // Bit 4-6: Reserved
                    // Bit 3: bitWillDetach
                    (if true {0x8} else {0}) |
                    // Bit 2: bitManifestationTolerant
                    (if M::MANIFESTATION_TOLERANT {0x4} else {0}) |
                    // Bit 1: bitCanUpload
                    (if M::HAS_UPLOAD {0x2} else {0}) |
                    // Bit 0: bitCanDnload
                    (if M::HAS_DOWNLOAD {0x1} else {0}),
                // wDetachTimeOut
                (M::DETACH_TIMEOUT & 0xff) as u8,
                (M::DETACH_TIMEOUT >> 8) as u8,
                // wTransferSize
                (M::TRANSFER_SIZE & 0xff) as u8,
                (M::TRANSFER_SIZE >> 8) as u8,
                // bcdDFUVersion
                0x1a,
                0x01,
            ],
        )?;

        Ok(())
    }

    fn get_string(&self, index: StringIndex, lang_id: u16) -> Option<&str> {
        if lang_id == usb_device::descriptor::lang_id::ENGLISH_US || lang_id == 0 {
            if index == self.interface_string {
                return Some(M::MEM_INFO_STRING);
            }
        }
        None
    }

    // Handle control requests to the host.
    fn control_in(&mut self, xfer: ControlIn<B>) {
        let req = *xfer.request();

        if req.recipient != control::Recipient::Interface || req.index != u8::from(self.if_num) as u16
        {
            return;
        }

        match req.request_type {
            control::RequestType::Class => {}
            control::RequestType::Vendor => {
                if self.mem.handle_nonstandard_request(req.request) {
                    xfer.accept_with(&[]).ok();
                } else {
                    xfer.reject().ok();
                }
                return;
            }
            _ => return,
        }

        match req.request {
            DFU_UPLOAD => {
                self.upload(xfer, req);
            }
            DFU_GETSTATUS => {
                self.get_status(xfer, req);
            }
            DFU_GETSTATE => {
                self.get_state(xfer, req);
            }
            _ => {
                if self.mem.handle_nonstandard_request(req.request) {
                    xfer.accept_with(&[]).ok();
                } else {
                    xfer.reject().ok();
                }
            }
        }
    }

    // Handle a control request from the host.
    fn control_out(&mut self, xfer: ControlOut<B>) {
        let req = *xfer.request();

        if req.recipient != control::Recipient::Interface || req.index != u8::from(self.if_num) as u16
        {
            return;
        }

        match req.request_type {
            control::RequestType::Class => {}
            control::RequestType::Vendor => {
                if self.mem.handle_nonstandard_request(req.request) {
                    xfer.accept().ok();
                } else {
                    xfer.reject().ok();
                }
                return;
            }
            _ => return,
        }

        match req.request {
            //DFU_DETACH => {},
            DFU_DNLOAD => {
                self.download(xfer, req);
            }
            DFU_CLRSTATUS => {
                self.clear_status(xfer);
            }
            DFU_ABORT => {
                self.abort(xfer);
            }
            _ => {
                if self.mem.handle_nonstandard_request(req.request) {
                    xfer.accept().ok();
                } else {
                    xfer.reject().ok();
                }
            }
        }
    }

    fn reset(&mut self) {
        let current = self.status.state();

        let next = if current == DFUState::AppDetach {
            DFUState::DfuIdle
        } else if let Some(overridden) = self.mem.usb_reset_override(current) {
            overridden
        } else {
            match current {
                DFUState::DfuIdle
                | DFUState::DfuDnloadSync
                | DFUState::DfuDnBusy
                | DFUState::DfuDnloadIdle
                | DFUState::DfuManifestSync
                | DFUState::DfuManifest
                | DFUState::DfuManifestWaitReset
                | DFUState::DfuUploadIdle => {
                    if self.mem.is_firmware_valid() {
                        DFUState::AppIdle
                    } else {
                        DFUState::DfuError
                    }
                }
                // DfuError and any unrecognized state unconditionally return
                // to the application.
                _ => DFUState::AppIdle,
            }
        };

        if next == DFUState::AppIdle {
            self.mem.reboot_to_runtime();
        }

        self.status.command = Command::None;
        self.status.pending = Command::None;
        self.status.new_state_ok(next);
    }

    fn poll(&mut self) {
        self.update_impl();
    }
}

impl<B: UsbBus, M: DFUMemIO> DFUClass<B, M> {
    /// Creates a new DFUClass with the provided UsbBus and
    /// DFUMemIO
    pub fn new<'a>(alloc: &'a UsbBusAllocator<B>, mem: M) -> Self {
        Self {
            if_num: alloc.interface(),
            status: DFUStatus::new(),
            interface_string: alloc.string(),
            _bus: PhantomData,
            mem,
        }
    }

    /// This function may be called just after `DFUClass::new()` to
    /// set DFU error state to "Device detected unexpected power on reset"
    /// instead of the usual `dfuIdle`.
    pub fn set_unexpected_reset_state(&mut self) {
        self.status
            .new_state_status(DFUState::DfuError, DFUStatusCode::ErrPOR);
    }

    /// This function may be called just after `DFUClass::new()` to
    /// set DFU error state to "Device’s firmware is corrupt. It cannot return to run-time (non-DFU) operations"
    /// instead of the usual `dfuIdle`.
    pub fn set_firmware_corrupted_state(&mut self) {
        self.status
            .new_state_status(DFUState::DfuError, DFUStatusCode::ErrFirmware);
    }

    /// Signals that the duration reported via the most recent
    /// `bwPollTimeout` has elapsed.
    ///
    /// `DfuDnBusy` moves back to `DfuDnloadSync` (the next `GETSTATUS` will
    /// resolve it to `DfuDnloadIdle` once the pending operation is done);
    /// `DfuManifest` moves to `DfuManifestWaitReset` or `DfuManifestSync`
    /// depending on [`DFUMemIO::MANIFESTATION_TOLERANT`]. Any other state is
    /// unaffected.
    ///
    /// Calling this is optional in practice: `poll()` already advances the
    /// same pending operation, and as a rule finishes it well before a timer
    /// started for `PROGRAM_TIME_MS`/`MANIFESTATION_TIME_MS` would expire.
    /// Use this entry point when the host-visible timing should track those
    /// durations exactly rather than `poll()`'s own schedule.
    pub fn on_poll_timeout(&mut self) {
        match self.status.state() {
            DFUState::DfuDnBusy => self.status.new_state_ok(DFUState::DfuDnloadSync),
            DFUState::DfuManifest => {
                if M::MANIFESTATION_TOLERANT {
                    self.status.new_state_ok(DFUState::DfuManifestSync)
                } else {
                    self.status.new_state_ok(DFUState::DfuManifestWaitReset)
                }
            }
            _ => {}
        }
    }

    fn clear_status(&mut self, xfer: ControlOut<B>) {
        match self.status.state() {
            DFUState::DfuError => {
                self.status.command = Command::None;
                self.status.pending = Command::None;
                self.status.new_state_ok(DFUState::DfuIdle);
                xfer.accept().ok();
            }
            _ => {
                self.status
                    .new_state_status(DFUState::DfuError, DFUStatusCode::ErrStalledPkt);
                xfer.reject().ok();
            }
        }
    }

    fn abort(&mut self, xfer: ControlOut<B>) {
        match self.status.state() {
            DFUState::DfuIdle
            | DFUState::DfuUploadIdle
            | DFUState::DfuDnloadIdle
            | DFUState::DfuDnloadSync
            | DFUState::DfuManifestSync => {
                self.mem.on_abort();
                self.status.command = Command::None;
                self.status.pending = Command::None;
                self.status.new_state_ok(DFUState::DfuIdle);
                xfer.accept().ok();
            }
            DFUState::AppDetach
            | DFUState::AppIdle
            | DFUState::DfuDnBusy
            | DFUState::DfuManifest
            | DFUState::DfuManifestWaitReset
            | DFUState::DfuError => {
                xfer.reject().ok();
            }
        }
    }

    fn download(&mut self, xfer: ControlOut<B>, req: Request) {
        let initial_state = self.status.state();

        if initial_state != DFUState::DfuIdle && initial_state != DFUState::DfuDnloadIdle {
            self.status
                .new_state_status(DFUState::DfuError, DFUStatusCode::ErrStalledPkt);
            xfer.reject().ok();
            return;
        }

        if !M::HAS_DOWNLOAD {
            self.status
                .new_state_status(DFUState::DfuError, DFUStatusCode::ErrStalledPkt);
            xfer.reject().ok();
            return;
        }

        if req.length == 0 {
            // End-of-download signal. Only legal once at least one non-empty
            // block has moved the device into DfuDnloadIdle; a zero-length
            // DNLOAD straight out of DfuIdle falls through to the stall
            // below, by policy (DFU 1.1 is ambiguous here).
            if initial_state == DFUState::DfuDnloadIdle {
                if self.mem.is_transfer_complete() {
                    self.status.command = Command::LeaveDFU;
                    self.status.new_state_ok(DFUState::DfuManifestSync);
                    xfer.accept().ok();
                } else {
                    self.status
                        .new_state_status(DFUState::DfuError, DFUStatusCode::ErrNotdone);
                    xfer.reject().ok();
                }
                return;
            }
        } else {
            // wValue is the host's block number, numbered from zero with no
            // reserved values; store the bytes now, commit them as block
            // req.value once the host polls for status.
            let data = xfer.data();
            match self.mem.store_write_buffer(data) {
                Err(_) => {
                    self.status
                        .new_state_status(DFUState::DfuError, DFUStatusCode::ErrStalledPkt);
                    xfer.reject().ok();
                }
                Ok(_) => {
                    self.status.command = Command::WriteMemory {
                        block_num: req.value,
                        len: data.len() as u16,
                    };
                    self.status.new_state_ok(DFUState::DfuDnloadSync);
                    xfer.accept().ok();
                }
            }
            return;
        }

        self.status
            .new_state_status(DFUState::DfuError, DFUStatusCode::ErrStalledPkt);
        xfer.reject().ok();
    }

    fn upload(&mut self, xfer: ControlIn<B>, req: Request) {
        let initial_state = self.status.state();

        if initial_state != DFUState::DfuIdle && initial_state != DFUState::DfuUploadIdle {
            self.status
                .new_state_status(DFUState::DfuError, DFUStatusCode::ErrStalledPkt);
            xfer.reject().ok();
            return;
        }

        if !M::HAS_UPLOAD {
            self.status
                .new_state_status(DFUState::DfuError, DFUStatusCode::ErrStalledPkt);
            xfer.reject().ok();
            return;
        }

        // wValue is the host's block number, numbered from zero with no
        // reserved values.
        let transfer_size = min(M::TRANSFER_SIZE, req.length);

        match self.mem.req_upload_data(req.value, transfer_size as usize) {
            Ok(b) => {
                // The callback contract caps a reply at the requested
                // size; a callback that hands back more than asked is
                // a programming error in the application, not a
                // protocol condition, so it is clamped here rather
                // than propagated to the host.
                let b = if b.len() > transfer_size as usize {
                    &b[..transfer_size as usize]
                } else {
                    b
                };
                if b.len() < transfer_size as usize {
                    // short frame, signals end of image
                    self.status.new_state_ok(DFUState::DfuIdle);
                } else {
                    self.status.new_state_ok(DFUState::DfuUploadIdle);
                }
                xfer.accept_with(b).ok();
            }
            Err(e) => {
                self.status.new_state_status(DFUState::DfuError, e.into());
                xfer.reject().ok();
            }
        }
    }

    fn get_state(&mut self, xfer: ControlIn<B>, req: Request) {
        // return current state, without any state transition
        if req.length > 0 {
            let v = self.status.state() as u8;
            xfer.accept_with(&[v]).ok();
        } else {
            self.status
                .new_state_status(DFUState::DfuError, DFUStatusCode::ErrStalledPkt);
            xfer.reject().ok();
        }
    }

    fn get_status(&mut self, xfer: ControlIn<B>, req: Request) {
        if req.length >= 6 && self.process() {
            self.status.poll_timeout = self.expected_timeout();
            self.status.istring = self.mem.status_string_index();
            let v: [u8; 6] = self.status.into();
            xfer.accept_with(&v).ok();
            return;
        }

        self.status
            .new_state_status(DFUState::DfuError, DFUStatusCode::ErrStalledPkt);
        xfer.reject().ok();
    }

    fn expected_timeout(&self) -> u32 {
        match self.status.pending {
            Command::WriteMemory {
                block_num: _,
                len: _,
            } => M::PROGRAM_TIME_MS,
            Command::LeaveDFU => M::MANIFESTATION_TIME_MS,
            _ => 0,
        }
    }

    fn update_impl(&mut self) {
        match self.status.pending {
            Command::LeaveDFU => {
                // may not return
                let mr = self.mem.manifestation();

                match mr {
                    Err(e) => self.status.new_state_status(DFUState::DfuError, e.into()),
                    Ok(_) => {
                        if M::MANIFESTATION_TOLERANT {
                            self.status.new_state_ok(DFUState::DfuManifestSync)
                        } else {
                            self.status.new_state_ok(DFUState::DfuManifestWaitReset)
                        }
                    }
                }
            }
            Command::WriteMemory { block_num, len } => {
                match self.mem.req_dnload_data(block_num, len as usize) {
                    Err(e) => self.status.new_state_status(DFUState::DfuError, e.into()),
                    Ok(_) => self.status.new_state_ok(DFUState::DfuDnloadSync),
                }
            }
            Command::None => {}
        }
        self.status.pending = Command::None;
    }

    fn process(&mut self) -> bool {
        let initial_state = self.status.state();
        if initial_state == DFUState::DfuDnloadSync {
            match self.status.command {
                Command::WriteMemory {
                    block_num: _,
                    len: _,
                } => {
                    self.status.pending = self.status.command;
                    self.status.command = Command::None;
                    self.status.new_state_ok(DFUState::DfuDnBusy);
                }
                _ => {
                    self.status.new_state_ok(DFUState::DfuDnloadIdle);
                }
            }
        } else if initial_state == DFUState::DfuManifestSync {
            match self.status.command {
                Command::None => {
                    if M::MANIFESTATION_TOLERANT {
                        // Leave manifestation, back to Idle
                        self.status.command = Command::None;
                        self.status.new_state_ok(DFUState::DfuIdle);
                    }
                }
                _ => {
                    // Start manifestation
                    self.status.pending = self.status.command;
                    self.status.command = Command::None;
                    self.status.new_state_ok(DFUState::DfuManifest);
                }
            }
        } else if initial_state == DFUState::DfuDnBusy {
            return false;
        }

        true
    }
}
