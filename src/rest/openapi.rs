use utoipa::OpenApi;

use super::{admin, cron};
use crate::access_codes::CodeCheck;
use crate::amenities::AmenityInput;
use crate::booking::{BookingChange, ClearReport, NewBooking};
use crate::models::{
    AccessCode, Amenity, Booking, BookingStatus, Community, CommunityNotification, Invite,
    NotificationKind, OperatingHours, Role, UserView,
};
use crate::sweep::{CompletionReport, ExpiryReport, ReminderReport, SweepFailure};

/// Served at `/api/openapi.json`; covers the scheduler and admin surface.
#[derive(OpenApi)]
#[openapi(
    info(title = "CircleIn API", description = "Community amenity booking"),
    paths(
        cron::expire_waitlist,
        cron::booking_reminders,
        cron::complete_bookings,
        admin::clear_bookings,
        admin::generate_codes,
        admin::list_access_codes,
        admin::invalidate_code,
        admin::replace_code,
        admin::create_community,
        admin::list_communities,
        admin::create_amenity,
        admin::update_amenity,
        admin::delete_amenity,
        admin::list_users,
        admin::delete_user,
        admin::restore_user,
        admin::set_role,
        admin::invite,
        admin::list_bookings,
        admin::broadcast,
    ),
    components(schemas(
        ExpiryReport,
        ReminderReport,
        CompletionReport,
        SweepFailure,
        admin::ClearRequest,
        admin::ClearResponse,
        admin::GenerateCodesRequest,
        admin::GenerateCodesResponse,
        admin::ReplaceCodeResponse,
        admin::NewCommunity,
        admin::RoleRequest,
        admin::InviteRequest,
        admin::BroadcastRequest,
        ClearReport,
        CodeCheck,
        NewBooking,
        BookingChange,
        AccessCode,
        Amenity,
        AmenityInput,
        OperatingHours,
        Booking,
        BookingStatus,
        Community,
        CommunityNotification,
        Invite,
        NotificationKind,
        Role,
        UserView,
    )),
    tags(
        (name = "cron", description = "Sweeps invoked by the external scheduler"),
        (name = "admin", description = "Community administration")
    )
)]
pub struct ApiDoc;
