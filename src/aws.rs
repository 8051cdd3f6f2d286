//! AWS S3 client construction and credential handling.

use std::{borrow::Cow, num::NonZeroU64};

use aws_config::{
	default_provider::credentials::Builder, AppName, BehaviorVersion, ConfigLoader, Region,
	SdkConfig,
};
use aws_credential_types::Credentials;

pub mod s3;
pub use s3::S3Sink;

/// The minimum size of a part in a multipart upload (excluding the last part). A hard limit
/// imposed by S3 itself.
// SAFETY: hardcoded
pub const MINIMUM_MULTIPART_PART_SIZE: NonZeroU64 =
	unsafe { NonZeroU64::new_unchecked(8 * 1024 * 1024) };

/// Implement this trait on an Args struct to be able to use it as an AWS credential source.
pub trait AwsArgs {
	fn aws_access_key_id(&self) -> Option<Cow<'_, str>>;
	fn aws_secret_access_key(&self) -> Option<Cow<'_, str>>;
	fn aws_region(&self) -> Option<Cow<'_, str>>;
}

macro_rules! standard_aws_args {
	($args:ident) => {
		impl crate::aws::AwsArgs for $args {
			fn aws_access_key_id(&self) -> Option<::std::borrow::Cow<'_, str>> {
				self.aws_access_key_id
					.as_ref()
					.map(|s| ::std::borrow::Cow::Borrowed(s.as_str()))
			}

			fn aws_secret_access_key(&self) -> Option<::std::borrow::Cow<'_, str>> {
				self.aws_secret_access_key
					.as_ref()
					.map(|s| ::std::borrow::Cow::Borrowed(s.as_str()))
			}

			fn aws_region(&self) -> Option<::std::borrow::Cow<'_, str>> {
				self.aws_region
					.as_ref()
					.map(|s| ::std::borrow::Cow::Borrowed(s.as_str()))
			}
		}
	};
}
pub(crate) use standard_aws_args;

/// Get AWS config from the environment, or credentials files, or ambient, etc.
///
/// A Minio-style test endpoint (see `--test-run`) is reached through the ordinary
/// `AWS_ENDPOINT_URL` mechanism, which the credential/config chain already honors.
pub async fn init(args: &dyn AwsArgs) -> SdkConfig {
	let mut config = ConfigLoader::default()
		.behavior_version(BehaviorVersion::v2023_11_09())
		.app_name(AppName::new(crate::APP_NAME).unwrap());

	if let (Some(key_id), Some(secret)) = (args.aws_access_key_id(), args.aws_secret_access_key()) {
		let mut chain = Builder::default()
			.with_custom_credential_source("args", Credentials::from_keys(key_id, secret, None));
		if let Some(region) = args.aws_region() {
			chain = chain.region(Region::new(region.into_owned()));
		}
		config = config.credentials_provider(chain.build().await);
	} else if let Some(region) = args.aws_region() {
		config = config.region(Region::new(region.into_owned()));
	}

	config.load().await
}

/// Standard set of AWS credential/region flags, flattened into every action that talks to S3.
#[derive(Debug, Clone, clap::Args)]
pub struct AwsFlags {
	/// AWS access key ID. If not given, falls back to the ambient credential chain.
	#[arg(long, env = "AWS_ACCESS_KEY_ID")]
	pub aws_access_key_id: Option<String>,

	/// AWS secret access key. If not given, falls back to the ambient credential chain.
	#[arg(long, env = "AWS_SECRET_ACCESS_KEY")]
	pub aws_secret_access_key: Option<String>,

	/// AWS region to operate in.
	#[arg(long, env = "AWS_REGION")]
	pub aws_region: Option<String>,
}

standard_aws_args!(AwsFlags);
